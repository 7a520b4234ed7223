//! Reactor-managed transport handles.
//!
//! A [`Channel`] is the underlying transport of one socket core: a TCP
//! stream (possibly still pending activation), a UDP socket, or a listener.
//! All channel I/O runs in reactor tasks; callers only touch the channel
//! through its queues, budget counters, and the kept duplicate fd.

pub(crate) mod datagram;
pub(crate) mod listener;
pub(crate) mod stream;

use crate::error::SockError;
use crate::runtime::SharedCompletion;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Bytes a stream channel accepts before it stops being writable, the
/// facade's model of "bytes writable without blocking the reactor".
pub(crate) const WRITE_BUDGET: usize = 256 * 1024;

/// Read chunk size for stream reader tasks.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Largest datagram the reader task will deliver.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// A write handed to the writer task. `done` resolves once the bytes have
/// been written and flushed; blocking senders wait on it, non-blocking
/// senders pass `None`.
pub(crate) struct WriteCmd {
  pub buf: Bytes,
  pub done: Option<SharedCompletion<Result<(), SockError>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
  Stream,
  Datagram,
  Listener,
}

/// I/O state of a channel.
pub(crate) enum ChannelIo {
  /// Stream exists but no reader/writer task runs yet. Accepted children
  /// and not-yet-handshaken TLS clients stay here until first use.
  PendingStream(Option<tokio::net::TcpStream>),
  /// A TLS handshake owns the stream; neither plain activation nor another
  /// handshake may claim it.
  Handshaking,
  /// Reader/writer tasks are running.
  ActiveStream {
    writer_tx: async_channel::Sender<WriteCmd>,
    read_cancel: CancellationToken,
  },
  Datagram {
    sock: Arc<UdpSocket>,
  },
  Listener,
  Closed,
}

impl std::fmt::Debug for ChannelIo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      ChannelIo::PendingStream(_) => "PendingStream",
      ChannelIo::Handshaking => "Handshaking",
      ChannelIo::ActiveStream { .. } => "ActiveStream",
      ChannelIo::Datagram { .. } => "Datagram",
      ChannelIo::Listener => "Listener",
      ChannelIo::Closed => "Closed",
    };
    f.write_str(s)
  }
}

#[derive(Debug)]
pub(crate) struct Channel {
  pub kind: ChannelKind,
  /// Duplicate of the raw socket fd, kept so option updates and address
  /// queries reach the live socket after the stream moved into I/O tasks.
  pub fd: OwnedFd,
  pub local_addr: Option<SocketAddr>,
  pub peer_addr: RwLock<Option<SocketAddr>>,
  pub io: Mutex<ChannelIo>,
  /// Cancels every task tied to this channel on close.
  pub cancel: CancellationToken,
  /// Remaining bytes the channel accepts without blocking.
  pub write_budget: AtomicUsize,
  pub write_gate: Mutex<()>,
  pub write_cv: Condvar,
}

impl Channel {
  pub fn new(
    kind: ChannelKind,
    fd: OwnedFd,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    io: ChannelIo,
  ) -> Arc<Self> {
    Arc::new(Self {
      kind,
      fd,
      local_addr,
      peer_addr: RwLock::new(peer_addr),
      io: Mutex::new(io),
      cancel: CancellationToken::new(),
      write_budget: AtomicUsize::new(WRITE_BUDGET),
      write_gate: Mutex::new(()),
      write_cv: Condvar::new(),
    })
  }

  pub fn peer(&self) -> Option<SocketAddr> {
    *self.peer_addr.read()
  }

  /// True while the stream has not been claimed by activation or a TLS
  /// handshake.
  pub fn is_pending(&self) -> bool {
    matches!(*self.io.lock(), ChannelIo::PendingStream(_))
  }

  pub fn udp(&self) -> Option<Arc<UdpSocket>> {
    match &*self.io.lock() {
      ChannelIo::Datagram { sock } => Some(sock.clone()),
      _ => None,
    }
  }

  /// Tears the channel down: cancels its tasks and drops the transport.
  pub fn close(&self) {
    self.cancel.cancel();
    *self.io.lock() = ChannelIo::Closed;
    // Wake senders blocked on the write gate so they observe the closure.
    let _gate = self.write_gate.lock();
    self.write_cv.notify_all();
  }
}

/// Duplicates a raw fd into an owned handle for option application.
pub(crate) fn dup_fd(raw: RawFd) -> io::Result<OwnedFd> {
  // The source fd is owned by a live socket for the duration of this call.
  let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
  borrowed.try_clone_to_owned()
}

pub(crate) fn dup_fd_of<T: AsRawFd>(sock: &T) -> Result<OwnedFd, SockError> {
  dup_fd(sock.as_raw_fd()).map_err(SockError::from_io)
}
