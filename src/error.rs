use std::io;
use thiserror::Error;

/// Sub-kind for TLS failures, stable across rustls versions so callers can
/// match on the class of failure rather than the underlying detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
  /// Protocol negotiation or generic handshake failure.
  HandshakeFailure,
  /// A record could not be parsed (e.g. the peer is not speaking TLS).
  BadRecord,
  /// Certificate validation failed; the peer could not be verified.
  PeerUnverified,
  /// No common protocol version or cipher suite with the peer.
  ProtocolMismatch,
}

impl std::fmt::Display for TlsErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      TlsErrorKind::HandshakeFailure => "handshake failure",
      TlsErrorKind::BadRecord => "bad record",
      TlsErrorKind::PeerUnverified => "peer unverified",
      TlsErrorKind::ProtocolMismatch => "protocol mismatch",
    };
    f.write_str(s)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum SockError {
  // --- Non-blocking / timeout ---
  #[error("The operation could not complete without blocking")]
  WouldBlock, // EWOULDBLOCK / EAGAIN

  #[error("Operation timed out")]
  Timeout, // ETIMEDOUT

  // --- Connection errors ---
  #[error("Connection refused by peer: {0}")]
  ConnectionRefused(String), // ECONNREFUSED

  #[error("Connection reset or closed by peer")]
  ConnectionReset, // ECONNRESET / EPIPE

  #[error("Socket is not connected")]
  NotConnected, // ENOTCONN

  #[error("Socket is already connected")]
  AlreadyConnected, // EISCONN

  // --- Address errors ---
  #[error("Address already in use: {0}")]
  AddrInUse(String), // EADDRINUSE

  #[error("Address not available: {0}")]
  AddrNotAvailable(String), // EADDRNOTAVAIL

  #[error("Host is unreachable: {0}")]
  HostUnreachable(String), // EHOSTUNREACH

  #[error("Name resolution failed: {0}")]
  NameResolution(String), // getaddrinfo failure

  #[error("Invalid address for this socket: {0}")]
  InvalidAddress(String), // malformed or wrong-family address

  // --- Option errors ---
  #[error("Protocol not available: option ({0}, {1})")]
  ProtocolNotAvailable(i32, i32), // ENOPROTOOPT

  // --- State errors ---
  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String), // EINVAL

  #[error("Operation is invalid for the current socket state: {0}")]
  InvalidState(&'static str),

  #[error("Socket handle is closed")]
  Closed, // EBADF

  // --- Resource limits ---
  #[error("Resource exhausted: {0}")]
  ResourceExhausted(&'static str), // thread/queue allocation failure

  // --- TLS ---
  #[cfg(feature = "tls")]
  #[error("TLS error ({kind}): {detail}")]
  Tls { kind: TlsErrorKind, detail: String },

  // --- Fallbacks ---
  #[error("I/O error ({kind:?}): {message}")]
  Io { kind: io::ErrorKind, message: String },

  #[error("Internal library error: {0}")]
  Internal(String),
}

impl SockError {
  /// Maps common `std::io::Error` kinds at the facade boundary so no raw
  /// reactor/channel error type reaches caller code.
  pub(crate) fn from_io(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::WouldBlock => SockError::WouldBlock,
      io::ErrorKind::TimedOut => SockError::Timeout,
      io::ErrorKind::ConnectionRefused => SockError::ConnectionRefused(e.to_string()),
      io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
        SockError::ConnectionReset
      }
      io::ErrorKind::NotConnected => SockError::NotConnected,
      io::ErrorKind::AddrInUse => SockError::AddrInUse(e.to_string()),
      io::ErrorKind::AddrNotAvailable => SockError::AddrNotAvailable(e.to_string()),
      io::ErrorKind::HostUnreachable => SockError::HostUnreachable(e.to_string()),
      kind => SockError::Io {
        kind,
        message: e.to_string(),
      },
    }
  }

  /// Like [`SockError::from_io`] but keeps the endpoint in the message for
  /// errors where the address is the interesting part.
  pub(crate) fn from_io_endpoint(e: io::Error, endpoint: &str) -> Self {
    match e.kind() {
      io::ErrorKind::AddrInUse => SockError::AddrInUse(endpoint.to_string()),
      io::ErrorKind::AddrNotAvailable => SockError::AddrNotAvailable(endpoint.to_string()),
      io::ErrorKind::ConnectionRefused => SockError::ConnectionRefused(endpoint.to_string()),
      io::ErrorKind::HostUnreachable => SockError::HostUnreachable(endpoint.to_string()),
      _ => SockError::from_io(e),
    }
  }

  /// POSIX errno analogue for this error, used by `connect_ex` status codes
  /// and the SO_ERROR pseudo-option.
  pub fn code(&self) -> i32 {
    match self {
      SockError::WouldBlock => libc::EWOULDBLOCK,
      SockError::Timeout => libc::ETIMEDOUT,
      SockError::ConnectionRefused(_) => libc::ECONNREFUSED,
      SockError::ConnectionReset => libc::ECONNRESET,
      SockError::NotConnected => libc::ENOTCONN,
      SockError::AlreadyConnected => libc::EISCONN,
      SockError::AddrInUse(_) => libc::EADDRINUSE,
      SockError::AddrNotAvailable(_) => libc::EADDRNOTAVAIL,
      SockError::HostUnreachable(_) => libc::EHOSTUNREACH,
      SockError::NameResolution(_) => libc::EAI_FAIL,
      SockError::InvalidAddress(_) => libc::EINVAL,
      SockError::ProtocolNotAvailable(_, _) => libc::ENOPROTOOPT,
      SockError::InvalidArgument(_) => libc::EINVAL,
      SockError::InvalidState(_) => libc::EINVAL,
      SockError::Closed => libc::EBADF,
      SockError::ResourceExhausted(_) => libc::EMFILE,
      #[cfg(feature = "tls")]
      SockError::Tls { .. } => libc::EPROTO,
      SockError::Io { .. } => libc::EIO,
      SockError::Internal(_) => libc::EIO,
    }
  }
}
