// src/lib.rs

//! resock - blocking POSIX-style sockets over a shared asynchronous reactor.
//!
//! All actual I/O runs on a fixed-size multi-threaded reactor; the public
//! surface is a synchronous socket API (bind, connect, listen, accept,
//! send/recv, select/poll, optional TLS wrapping) whose blocking calls
//! suspend the caller on futures and condition variables, never by
//! spinning, and whose non-blocking calls never suspend at all.

/// Host/service resolution and the address-tuple conversions.
pub mod addr;
/// Defines the error taxonomy crossing the facade boundary.
pub mod error;
/// The socket option allow-list and typed option values.
pub mod options;
/// Level-triggered readiness: `select` and the `Poller` registry.
pub mod ready;
/// The shared reactor runtime and the blocking-bridge primitives.
pub mod runtime;
/// The socket core and its public blocking handle.
pub mod socket;
/// TLS wrapping of stream sockets.
#[cfg(feature = "tls")]
pub mod tls;
/// Reactor-managed transport channels (TCP, UDP, listeners).
mod transport;

// Re-export the primary surface at the crate root.
pub use addr::{Endpoint, Family, ToEndpoint};
pub use error::{SockError, TlsErrorKind};
pub use options::{OptValue, Proto};
pub use ready::{select, PollEvents, Poller};
pub use runtime::{init, shutdown, ReactorConfig};
pub use socket::{
  create_connection, default_timeout, set_default_timeout, ConnectStatus, SockType, Socket,
  SocketKind,
};
#[cfg(feature = "tls")]
pub use tls::{HandshakeState, TlsContext, TlsSocket, WrapOptions};

// --- Top-Level Library Information Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}
