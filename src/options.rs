//! Socket option storage and validation.
//!
//! A static allow-list maps `(protocol, level, name)` to a typed setter;
//! everything outside the list fails `ProtocolNotAvailable` at the boundary.
//! Values set before a channel exists are staged and replayed when the
//! channel is created; values set afterwards are applied to the live socket
//! immediately, so the very next I/O operation observes them.

use crate::error::SockError;

use parking_lot::Mutex;
use socket2::SockRef;
use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

// Option levels and names are the POSIX constants.
pub const SOL_SOCKET: i32 = libc::SOL_SOCKET;
pub const IPPROTO_TCP: i32 = libc::IPPROTO_TCP;
pub const IPPROTO_UDP: i32 = libc::IPPROTO_UDP;

pub const SO_KEEPALIVE: i32 = libc::SO_KEEPALIVE;
pub const SO_LINGER: i32 = libc::SO_LINGER;
pub const SO_RCVBUF: i32 = libc::SO_RCVBUF;
pub const SO_SNDBUF: i32 = libc::SO_SNDBUF;
pub const SO_REUSEADDR: i32 = libc::SO_REUSEADDR;
pub const SO_BROADCAST: i32 = libc::SO_BROADCAST;
pub const SO_RCVTIMEO: i32 = libc::SO_RCVTIMEO;
pub const SO_SNDTIMEO: i32 = libc::SO_SNDTIMEO;
pub const TCP_NODELAY: i32 = libc::TCP_NODELAY;

// Pseudo-options: computed from socket state, never stored.
pub const SO_TYPE: i32 = libc::SO_TYPE;
pub const SO_ERROR: i32 = libc::SO_ERROR;
pub const SO_ACCEPTCONN: i32 = libc::SO_ACCEPTCONN;

/// Transport protocol of a socket, fixed at creation from its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
  Tcp,
  Udp,
}

/// A validated socket option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
  Bool(bool),
  Int(i32),
  /// SO_LINGER: `None` disables lingering, `Some(d)` lingers up to `d`.
  Linger(Option<Duration>),
}

impl OptValue {
  pub fn as_int(&self) -> i32 {
    match self {
      OptValue::Bool(b) => *b as i32,
      OptValue::Int(v) => *v,
      OptValue::Linger(None) => 0,
      OptValue::Linger(Some(d)) => d.as_secs() as i32,
    }
  }
}

/// Options the allow-list maps onto the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChannelOpt {
  KeepAlive,
  Linger,
  RecvBuf,
  SendBuf,
  ReuseAddr,
  NoDelay,
  Broadcast,
}

/// Resolution of a `(level, name)` pair against the allow-list.
pub(crate) enum OptEntry {
  Channel(ChannelOpt),
  /// SO_RCVTIMEO / SO_SNDTIMEO alias the socket timeout (milliseconds,
  /// 0 = block forever). Handled by the socket core, not stored here.
  Timeout,
}

/// The static allow-list. Anything not matched here is not available for
/// the protocol.
pub(crate) fn lookup(proto: Proto, level: i32, name: i32) -> Result<OptEntry, SockError> {
  let entry = match (proto, level, name) {
    (Proto::Tcp, l, n) if l == SOL_SOCKET && n == SO_KEEPALIVE => OptEntry::Channel(ChannelOpt::KeepAlive),
    (Proto::Tcp, l, n) if l == SOL_SOCKET && n == SO_LINGER => OptEntry::Channel(ChannelOpt::Linger),
    (Proto::Tcp, l, n) if l == IPPROTO_TCP && n == TCP_NODELAY => OptEntry::Channel(ChannelOpt::NoDelay),
    (Proto::Udp, l, n) if l == SOL_SOCKET && n == SO_BROADCAST => OptEntry::Channel(ChannelOpt::Broadcast),
    (_, l, n) if l == SOL_SOCKET && n == SO_RCVBUF => OptEntry::Channel(ChannelOpt::RecvBuf),
    (_, l, n) if l == SOL_SOCKET && n == SO_SNDBUF => OptEntry::Channel(ChannelOpt::SendBuf),
    (_, l, n) if l == SOL_SOCKET && n == SO_REUSEADDR => OptEntry::Channel(ChannelOpt::ReuseAddr),
    (_, l, n) if l == SOL_SOCKET && (n == SO_RCVTIMEO || n == SO_SNDTIMEO) => OptEntry::Timeout,
    _ => return Err(SockError::ProtocolNotAvailable(level, name)),
  };
  Ok(entry)
}

/// Validates and normalizes a value for a channel option.
pub(crate) fn validate(opt: ChannelOpt, value: OptValue) -> Result<OptValue, SockError> {
  use ChannelOpt::*;
  match opt {
    KeepAlive | ReuseAddr | NoDelay | Broadcast => match value {
      OptValue::Bool(b) => Ok(OptValue::Bool(b)),
      OptValue::Int(v) => Ok(OptValue::Bool(v != 0)),
      other => Err(SockError::InvalidArgument(format!(
        "boolean option expects bool or int, got {:?}",
        other
      ))),
    },
    RecvBuf | SendBuf => match value {
      OptValue::Int(v) if v > 0 => Ok(OptValue::Int(v)),
      other => Err(SockError::InvalidArgument(format!(
        "buffer size expects a positive int, got {:?}",
        other
      ))),
    },
    Linger => match value {
      OptValue::Linger(l) => Ok(OptValue::Linger(l)),
      OptValue::Int(v) if v <= 0 => Ok(OptValue::Linger(None)),
      OptValue::Int(v) => Ok(OptValue::Linger(Some(Duration::from_secs(v as u64)))),
      other => Err(SockError::InvalidArgument(format!(
        "linger expects linger or int, got {:?}",
        other
      ))),
    },
  }
}

fn apply_to_fd(fd: &OwnedFd, opt: ChannelOpt, value: &OptValue) -> io::Result<()> {
  let sock = SockRef::from(fd);
  match (opt, value) {
    (ChannelOpt::KeepAlive, OptValue::Bool(b)) => sock.set_keepalive(*b),
    (ChannelOpt::Linger, OptValue::Linger(l)) => sock.set_linger(*l),
    (ChannelOpt::RecvBuf, OptValue::Int(v)) => sock.set_recv_buffer_size(*v as usize),
    (ChannelOpt::SendBuf, OptValue::Int(v)) => sock.set_send_buffer_size(*v as usize),
    (ChannelOpt::ReuseAddr, OptValue::Bool(b)) => sock.set_reuse_address(*b),
    (ChannelOpt::NoDelay, OptValue::Bool(b)) => sock.set_nodelay(*b),
    (ChannelOpt::Broadcast, OptValue::Bool(b)) => sock.set_broadcast(*b),
    // validate() normalized the value; reaching here is a table bug.
    _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "option/value mismatch")),
  }
}

/// Per-socket validated option store.
#[derive(Debug)]
pub(crate) struct OptionTable {
  proto: Proto,
  values: Mutex<HashMap<(i32, i32), OptValue>>,
}

impl OptionTable {
  pub fn new(proto: Proto) -> Self {
    Self {
      proto,
      values: Mutex::new(HashMap::new()),
    }
  }

  pub fn proto(&self) -> Proto {
    self.proto
  }

  /// Validates, stores, and (when a channel exists) applies an option.
  /// Validation failures leave the stored set untouched.
  pub fn set(
    &self,
    level: i32,
    name: i32,
    value: OptValue,
    fd: Option<&OwnedFd>,
  ) -> Result<(), SockError> {
    let entry = lookup(self.proto, level, name)?;
    let opt = match entry {
      OptEntry::Channel(opt) => opt,
      OptEntry::Timeout => {
        return Err(SockError::Internal("timeout alias must be handled by the socket".into()))
      }
    };
    let value = validate(opt, value)?;
    tracing::debug!(level, name, ?value, "Setting socket option");
    if let Some(fd) = fd {
      apply_to_fd(fd, opt, &value).map_err(SockError::from_io)?;
    }
    self.values.lock().insert((level, name), value);
    Ok(())
  }

  /// Returns the staged/stored value, or the kind default when unset.
  pub fn get(&self, level: i32, name: i32) -> Result<OptValue, SockError> {
    let entry = lookup(self.proto, level, name)?;
    let opt = match entry {
      OptEntry::Channel(opt) => opt,
      OptEntry::Timeout => {
        return Err(SockError::Internal("timeout alias must be handled by the socket".into()))
      }
    };
    if let Some(v) = self.values.lock().get(&(level, name)) {
      return Ok(v.clone());
    }
    Ok(match opt {
      ChannelOpt::Linger => OptValue::Linger(None),
      ChannelOpt::RecvBuf | ChannelOpt::SendBuf => OptValue::Int(0),
      _ => OptValue::Bool(false),
    })
  }

  /// Replays every staged option onto a freshly created channel.
  pub fn apply_all(&self, fd: &OwnedFd) -> Result<(), SockError> {
    let values = self.values.lock();
    for ((level, name), value) in values.iter() {
      if let Ok(OptEntry::Channel(opt)) = lookup(self.proto, *level, *name) {
        apply_to_fd(fd, opt, value).map_err(SockError::from_io)?;
      }
    }
    Ok(())
  }

  /// Copies the current option set for an accepted child, so subsequent
  /// divergence between parent and child is independent.
  pub fn snapshot(&self) -> OptionTable {
    OptionTable {
      proto: self.proto,
      values: Mutex::new(self.values.lock().clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_option_is_rejected_and_store_untouched() {
    let table = OptionTable::new(Proto::Tcp);
    table
      .set(SOL_SOCKET, SO_KEEPALIVE, OptValue::Bool(true), None)
      .unwrap();
    let err = table.set(SOL_SOCKET, libc::SO_OOBINLINE, OptValue::Bool(true), None).unwrap_err();
    assert!(matches!(err, SockError::ProtocolNotAvailable(_, _)));
    assert_eq!(table.get(SOL_SOCKET, SO_KEEPALIVE).unwrap(), OptValue::Bool(true));
  }

  #[test]
  fn udp_rejects_tcp_only_options() {
    let table = OptionTable::new(Proto::Udp);
    let err = table
      .set(IPPROTO_TCP, TCP_NODELAY, OptValue::Bool(true), None)
      .unwrap_err();
    assert!(matches!(err, SockError::ProtocolNotAvailable(_, _)));
    table
      .set(SOL_SOCKET, SO_BROADCAST, OptValue::Int(1), None)
      .unwrap();
    assert_eq!(table.get(SOL_SOCKET, SO_BROADCAST).unwrap(), OptValue::Bool(true));
  }

  #[test]
  fn linger_normalizes_from_int() {
    let table = OptionTable::new(Proto::Tcp);
    table.set(SOL_SOCKET, SO_LINGER, OptValue::Int(5), None).unwrap();
    assert_eq!(
      table.get(SOL_SOCKET, SO_LINGER).unwrap(),
      OptValue::Linger(Some(Duration::from_secs(5)))
    );
    table.set(SOL_SOCKET, SO_LINGER, OptValue::Int(0), None).unwrap();
    assert_eq!(table.get(SOL_SOCKET, SO_LINGER).unwrap(), OptValue::Linger(None));
  }

  #[test]
  fn buffer_sizes_must_be_positive() {
    let table = OptionTable::new(Proto::Tcp);
    let err = table.set(SOL_SOCKET, SO_RCVBUF, OptValue::Int(0), None).unwrap_err();
    assert!(matches!(err, SockError::InvalidArgument(_)));
  }

  #[test]
  fn snapshot_diverges_independently() {
    let parent = OptionTable::new(Proto::Tcp);
    parent.set(SOL_SOCKET, SO_KEEPALIVE, OptValue::Bool(true), None).unwrap();
    let child = parent.snapshot();
    child.set(SOL_SOCKET, SO_KEEPALIVE, OptValue::Bool(false), None).unwrap();
    assert_eq!(parent.get(SOL_SOCKET, SO_KEEPALIVE).unwrap(), OptValue::Bool(true));
    assert_eq!(child.get(SOL_SOCKET, SO_KEEPALIVE).unwrap(), OptValue::Bool(false));
  }
}
