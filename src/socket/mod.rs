//! The public blocking socket surface.
//!
//! A [`Socket`] is a handle over a reference-counted socket core: `dup`
//! hands out another handle sharing the same channel and read/write state,
//! and the core is released only when the last handle closes.

pub(crate) mod core;

pub use self::core::{ConnectStatus, SockType, SocketKind};

use self::core::SocketCore;
use crate::addr::{resolve, Endpoint, Family, ToEndpoint};
use crate::error::SockError;
use crate::options::OptValue;
use crate::runtime;

use bytes::Bytes;
use parking_lot::RwLock;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static DEFAULT_TIMEOUT: RwLock<Option<Duration>> = RwLock::new(None);

/// Sets the process-wide default timeout new sockets start with.
pub fn set_default_timeout(timeout: Option<Duration>) {
  *DEFAULT_TIMEOUT.write() = timeout;
}

/// The process-wide default timeout for new sockets.
pub fn default_timeout() -> Option<Duration> {
  *DEFAULT_TIMEOUT.read()
}

pub struct Socket {
  core: Arc<SocketCore>,
  closed: AtomicBool,
}

impl std::fmt::Debug for Socket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Socket")
      .field("id", &self.core.id)
      .field("kind", &self.core.kind())
      .field("closed", &self.closed.load(Ordering::SeqCst))
      .finish()
  }
}

impl Socket {
  /// Creates an unassigned socket. The shared reactor starts on first use;
  /// once it has been shut down, creation fails `ResourceExhausted`.
  pub fn new(family: Family, stype: SockType) -> Result<Self, SockError> {
    runtime::reactor()?;
    Ok(Self {
      core: SocketCore::new(family, stype, default_timeout()),
      closed: AtomicBool::new(false),
    })
  }

  pub(crate) fn from_core(core: Arc<SocketCore>) -> Self {
    Self {
      core,
      closed: AtomicBool::new(false),
    }
  }

  pub(crate) fn core_ref(&self) -> Result<&Arc<SocketCore>, SockError> {
    if self.closed.load(Ordering::SeqCst) {
      Err(SockError::Closed)
    } else {
      Ok(&self.core)
    }
  }

  /// Unique id of the underlying socket, shared by `dup` aliases. This is
  /// the key `select`/`poll` report readiness under.
  pub fn id(&self) -> u64 {
    self.core.id
  }

  pub fn family(&self) -> Family {
    self.core.family
  }

  pub fn sock_type(&self) -> SockType {
    self.core.stype
  }

  pub fn kind(&self) -> SocketKind {
    self.core.kind()
  }

  // --- timeout control ---

  /// `None` blocks indefinitely, `Some(ZERO)` never blocks, `Some(d)`
  /// bounds every suspending operation. Read at call time by each call.
  pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), SockError> {
    self.core_ref()?.set_timeout(timeout);
    Ok(())
  }

  pub fn timeout(&self) -> Result<Option<Duration>, SockError> {
    Ok(self.core_ref()?.timeout())
  }

  pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SockError> {
    self.set_timeout(if nonblocking { Some(Duration::ZERO) } else { None })
  }

  // --- connection lifecycle ---

  pub fn bind<E: ToEndpoint>(&self, endpoint: E) -> Result<(), SockError> {
    self.core_ref()?.bind(&endpoint.to_endpoint()?)
  }

  pub fn connect<E: ToEndpoint>(&self, endpoint: E) -> Result<(), SockError> {
    self.core_ref()?.connect(&endpoint.to_endpoint()?)
  }

  /// Connect progress as POSIX-style status codes, never an error, for
  /// non-blocking sockets.
  pub fn connect_ex<E: ToEndpoint>(&self, endpoint: E) -> ConnectStatus {
    let core = match self.core_ref() {
      Ok(core) => core,
      Err(e) => return ConnectStatus::Failed(e.code()),
    };
    let endpoint = match endpoint.to_endpoint() {
      Ok(endpoint) => endpoint,
      Err(e) => return ConnectStatus::Failed(e.code()),
    };
    core.connect_ex(&endpoint)
  }

  pub fn listen(&self, backlog: usize) -> Result<(), SockError> {
    self.core_ref()?.listen(backlog)
  }

  /// Pops one pre-accepted child produced by the reactor's accept loop,
  /// under the timeout contract.
  pub fn accept(&self) -> Result<(Socket, SocketAddr), SockError> {
    let (child, peer) = self.core_ref()?.accept()?;
    Ok((Socket::from_core(child), peer))
  }

  // --- data path ---

  pub fn send(&self, data: &[u8]) -> Result<usize, SockError> {
    self.core_ref()?.send(data)
  }

  pub fn sendall(&self, data: &[u8]) -> Result<(), SockError> {
    self.core_ref()?.sendall(data)
  }

  pub fn sendto<E: ToEndpoint>(&self, data: &[u8], endpoint: E) -> Result<usize, SockError> {
    self.core_ref()?.sendto(data, &endpoint.to_endpoint()?)
  }

  /// Receives up to `bufsize` bytes. An empty result signals EOF, exactly
  /// once blocking and immediately ever after.
  pub fn recv(&self, bufsize: usize) -> Result<Bytes, SockError> {
    self.core_ref()?.recv(bufsize)
  }

  pub fn recvfrom(&self, bufsize: usize) -> Result<(Bytes, SocketAddr), SockError> {
    self.core_ref()?.recvfrom(bufsize)
  }

  pub fn recv_into(&self, buf: &mut [u8]) -> Result<usize, SockError> {
    self.core_ref()?.recv_into(buf)
  }

  pub fn recvfrom_into(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError> {
    self.core_ref()?.recvfrom_into(buf)
  }

  pub fn shutdown(&self, how: Shutdown) -> Result<(), SockError> {
    self.core_ref()?.shutdown(how)
  }

  // --- handle lifecycle ---

  /// Closes this handle. The channel is released when the last handle
  /// (this one or a `dup` alias) closes. Safe to call repeatedly.
  pub fn close(&self) {
    if !self.closed.swap(true, Ordering::SeqCst) {
      self.core.close();
    }
  }

  /// Returns a new handle sharing the same underlying socket. Read/write
  /// state is shared; only close accounting is per-handle.
  pub fn dup(&self) -> Result<Socket, SockError> {
    let core = self.core_ref()?;
    core.incr_open();
    Ok(Socket {
      core: core.clone(),
      closed: AtomicBool::new(false),
    })
  }

  // --- introspection ---

  pub fn local_addr(&self) -> Result<SocketAddr, SockError> {
    self.core_ref()?.local_addr()
  }

  pub fn peer_addr(&self) -> Result<SocketAddr, SockError> {
    self.core_ref()?.peer_addr()
  }

  pub fn set_option(&self, level: i32, name: i32, value: OptValue) -> Result<(), SockError> {
    self.core_ref()?.set_option(level, name, value)
  }

  pub fn get_option(&self, level: i32, name: i32) -> Result<OptValue, SockError> {
    self.core_ref()?.get_option(level, name)
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    self.close();
  }
}

/// Connects to `endpoint` and returns the socket, trying every resolved
/// candidate address in order. `timeout` becomes the socket timeout before
/// the connect; `source_address` binds the local end first.
pub fn create_connection<E: ToEndpoint>(
  endpoint: E,
  timeout: Option<Duration>,
  source_address: Option<Endpoint>,
) -> Result<Socket, SockError> {
  let endpoint = endpoint.to_endpoint()?;
  let candidates = resolve(&endpoint, Family::Unspec, false, false)?;
  let mut last_err = None;
  for addr in candidates {
    let family = if addr.is_ipv4() { Family::Ipv4 } else { Family::Ipv6 };
    let sock = Socket::new(family, SockType::Stream)?;
    if let Err(e) = sock.set_timeout(timeout) {
      last_err = Some(e);
      continue;
    }
    if let Some(source) = &source_address {
      if let Err(e) = sock.bind(source.clone()) {
        last_err = Some(e);
        continue;
      }
    }
    match sock.connect(addr) {
      Ok(()) => return Ok(sock),
      Err(e) => {
        tracing::debug!(%addr, error = %e, "create_connection candidate failed");
        last_err = Some(e);
      }
    }
  }
  Err(last_err.unwrap_or_else(|| SockError::NameResolution(endpoint.to_string())))
}
