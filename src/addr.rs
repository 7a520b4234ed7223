//! Host/service resolution and address classification.
//!
//! Resolution runs on the caller thread, never on the reactor: the reactor
//! only ever sees already-resolved `SocketAddr`s.

use crate::error::SockError;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};

/// Address family of a socket, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  /// Resolve both IPv4 and IPv6 candidates; first match wins.
  Unspec,
  Ipv4,
  Ipv6,
}

impl Family {
  pub(crate) fn matches(&self, addr: &SocketAddr) -> bool {
    match self {
      Family::Unspec => true,
      Family::Ipv4 => addr.is_ipv4(),
      Family::Ipv6 => addr.is_ipv6(),
    }
  }

  pub(crate) fn wildcard_ip(&self) -> IpAddr {
    match self {
      Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
      _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
  }
}

/// A host/port pair before resolution. IPv6 endpoints may carry flowinfo and
/// scope_id (the 4-tuple form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub host: String,
  pub port: u16,
  pub flowinfo: u32,
  pub scope_id: u32,
}

impl Endpoint {
  fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      flowinfo: 0,
      scope_id: 0,
    }
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Conversion of the POSIX address-tuple forms into an [`Endpoint`].
/// 2-tuple `(host, port)` for IPv4/IPv6, 4-tuple `(host, port, flowinfo,
/// scope_id)` for IPv6.
pub trait ToEndpoint {
  fn to_endpoint(&self) -> Result<Endpoint, SockError>;
}

impl ToEndpoint for Endpoint {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    Ok(self.clone())
  }
}

impl ToEndpoint for (&str, u16) {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    Ok(Endpoint::new(self.0.trim(), self.1))
  }
}

impl ToEndpoint for (String, u16) {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    Ok(Endpoint::new(self.0.trim(), self.1))
  }
}

impl ToEndpoint for (IpAddr, u16) {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    Ok(Endpoint::new(self.0.to_string(), self.1))
  }
}

impl ToEndpoint for (&str, u16, u32, u32) {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    let mut ep = Endpoint::new(self.0.trim(), self.1);
    ep.flowinfo = self.2;
    ep.scope_id = self.3;
    Ok(ep)
  }
}

impl ToEndpoint for SocketAddr {
  fn to_endpoint(&self) -> Result<Endpoint, SockError> {
    let mut ep = Endpoint::new(self.ip().to_string(), self.port());
    if let SocketAddr::V6(v6) = self {
      ep.flowinfo = v6.flowinfo();
      ep.scope_id = v6.scope_id();
    }
    Ok(ep)
  }
}

/// Returns true if `host` parses as an IPv4 literal.
pub fn is_ipv4_address(host: &str) -> bool {
  host.parse::<Ipv4Addr>().is_ok()
}

/// Returns true if `host` parses as an IPv6 literal.
pub fn is_ipv6_address(host: &str) -> bool {
  host.parse::<Ipv6Addr>().is_ok()
}

/// Returns true if `host` parses as any IP literal.
pub fn is_ip_address(host: &str) -> bool {
  host.parse::<IpAddr>().is_ok()
}

/// Resolves `endpoint` to concrete transport addresses for `family`.
///
/// An empty host maps to the family wildcard when `passive` (bind) or to
/// loopback otherwise. With `numeric_only`, the host must already be an IP
/// literal; anything that would require a DNS lookup fails
/// [`SockError::NameResolution`].
pub fn resolve(
  endpoint: &Endpoint,
  family: Family,
  passive: bool,
  numeric_only: bool,
) -> Result<Vec<SocketAddr>, SockError> {
  let host = endpoint.host.as_str();

  if host.is_empty() {
    let ip = if passive {
      family.wildcard_ip()
    } else {
      match family {
        Family::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
      }
    };
    return Ok(vec![make_addr(ip, endpoint)]);
  }

  if let Ok(ip) = host.parse::<IpAddr>() {
    let addr = make_addr(ip, endpoint);
    if !family.matches(&addr) {
      return Err(SockError::InvalidAddress(format!(
        "literal {} does not match socket family {:?}",
        host, family
      )));
    }
    return Ok(vec![addr]);
  }

  if numeric_only {
    return Err(SockError::NameResolution(format!(
      "numeric host required, got name: {}",
      host
    )));
  }

  tracing::trace!(host, port = endpoint.port, ?family, "resolving host name");
  let candidates = (host, endpoint.port)
    .to_socket_addrs()
    .map_err(|e| SockError::NameResolution(format!("{}: {}", host, e)))?;

  let addrs: Vec<SocketAddr> = candidates.filter(|a| family.matches(a)).collect();
  if addrs.is_empty() {
    return Err(SockError::NameResolution(format!(
      "no {:?} address found for {}",
      family, host
    )));
  }
  Ok(addrs)
}

/// Resolves and returns the first candidate. Most socket operations want
/// exactly one address; multi-candidate iteration lives in
/// `create_connection`.
pub(crate) fn resolve_one(
  endpoint: &Endpoint,
  family: Family,
  passive: bool,
) -> Result<SocketAddr, SockError> {
  let addrs = resolve(endpoint, family, passive, false)?;
  Ok(addrs[0])
}

fn make_addr(ip: IpAddr, endpoint: &Endpoint) -> SocketAddr {
  match ip {
    IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), endpoint.port),
    IpAddr::V6(v6) => {
      SocketAddr::V6(SocketAddrV6::new(v6, endpoint.port, endpoint.flowinfo, endpoint.scope_id))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_host_binds_to_wildcard() {
    let ep = ("", 7000).to_endpoint().unwrap();
    let addrs = resolve(&ep, Family::Ipv4, true, false).unwrap();
    assert_eq!(addrs, vec!["0.0.0.0:7000".parse().unwrap()]);
    let addrs = resolve(&ep, Family::Ipv6, true, false).unwrap();
    assert_eq!(addrs, vec!["[::]:7000".parse().unwrap()]);
  }

  #[test]
  fn empty_host_connects_to_loopback() {
    let ep = ("", 7000).to_endpoint().unwrap();
    let addrs = resolve(&ep, Family::Ipv4, false, false).unwrap();
    assert_eq!(addrs, vec!["127.0.0.1:7000".parse().unwrap()]);
  }

  #[test]
  fn family_mismatch_is_rejected() {
    let ep = ("::1", 80).to_endpoint().unwrap();
    let err = resolve(&ep, Family::Ipv4, false, false).unwrap_err();
    assert!(matches!(err, SockError::InvalidAddress(_)));
  }

  #[test]
  fn numeric_only_rejects_names() {
    let ep = ("localhost", 80).to_endpoint().unwrap();
    let err = resolve(&ep, Family::Unspec, false, true).unwrap_err();
    assert!(matches!(err, SockError::NameResolution(_)));
  }

  #[test]
  fn four_tuple_carries_scope() {
    let ep = ("fe80::1", 80, 0, 3).to_endpoint().unwrap();
    let addrs = resolve(&ep, Family::Ipv6, false, false).unwrap();
    match addrs[0] {
      SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 3),
      _ => panic!("expected v6"),
    }
  }

  #[test]
  fn literal_classifiers() {
    assert!(is_ipv4_address("10.0.0.1"));
    assert!(!is_ipv4_address("10.0.0"));
    assert!(is_ipv6_address("::1"));
    assert!(is_ip_address("::1"));
    assert!(!is_ip_address("example.org"));
  }
}
