//! Stream (TCP) channel: connect, activation, and the reader/writer tasks.
//!
//! I/O tasks are generic over the stream type so a TLS stream installed
//! after a handshake reuses the same machinery as a plain TCP stream.

use crate::error::SockError;
use crate::ready::Notice;
use crate::runtime::{self, Completion, SharedCompletion};
use crate::socket::core::{InboundMsg, SocketCore};
use crate::transport::{dup_fd_of, Channel, ChannelIo, ChannelKind, WriteCmd, READ_CHUNK};

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

/// Kicks off a client connect on the reactor and returns the completion the
/// caller (or a later `connect_ex`) waits on.
pub(crate) fn start_connect(
  core: &Arc<SocketCore>,
  addr: SocketAddr,
) -> SharedCompletion<Result<(), SockError>> {
  let done = Completion::new();
  let reactor = match runtime::reactor() {
    Ok(reactor) => reactor,
    Err(e) => {
      done.set(Err(e));
      return done;
    }
  };
  let core = core.clone();
  let task_done = done.clone();
  reactor.spawn(async move {
    match connect_task(&core, addr).await {
      Ok(()) => {
        tracing::debug!(sock_id = core.id, %addr, "Connect completed");
        task_done.set(Ok(()));
        core.notify_selectors(Notice::default());
      }
      Err(e) => {
        tracing::debug!(sock_id = core.id, %addr, error = %e, "Connect failed");
        core.latch_code(e.code());
        task_done.set(Err(e));
        core.notify_selectors(Notice::exception());
      }
    }
  });
  done
}

async fn connect_task(core: &Arc<SocketCore>, addr: SocketAddr) -> Result<(), SockError> {
  let tsock = if addr.is_ipv4() {
    TcpSocket::new_v4()
  } else {
    TcpSocket::new_v6()
  }
  .map_err(SockError::from_io)?;

  let fd = dup_fd_of(&tsock)?;
  core.options.apply_all(&fd)?;
  if let Some(bind) = *core.bind_addr.read() {
    tsock
      .bind(bind)
      .map_err(|e| SockError::from_io_endpoint(e, &bind.to_string()))?;
  }
  let stream = tsock
    .connect(addr)
    .await
    .map_err(|e| SockError::from_io_endpoint(e, &addr.to_string()))?;
  core.install_channel(make_channel(stream, fd)?);
  Ok(())
}

/// Wraps a connected stream in a channel, pending activation.
pub(crate) fn make_channel(stream: TcpStream, fd: OwnedFd) -> Result<Arc<Channel>, SockError> {
  let local = stream.local_addr().ok();
  let peer = stream.peer_addr().ok();
  Ok(Channel::new(
    ChannelKind::Stream,
    fd,
    local,
    peer,
    ChannelIo::PendingStream(Some(stream)),
  ))
}

/// Starts I/O tasks for a still-pending stream. Idempotent once active.
pub(crate) fn activate(core: &Arc<SocketCore>, channel: &Arc<Channel>) -> Result<(), SockError> {
  let mut io = channel.io.lock();
  match &mut *io {
    ChannelIo::PendingStream(slot) => {
      let stream = slot.take().expect("pending stream present");
      let (writer_tx, writer_rx) = async_channel::unbounded();
      let read_cancel = channel.cancel.child_token();
      *io = ChannelIo::ActiveStream {
        writer_tx,
        read_cancel: read_cancel.clone(),
      };
      drop(io);
      spawn_io(core.clone(), channel.clone(), stream, writer_rx, read_cancel)
    }
    ChannelIo::ActiveStream { .. } => Ok(()),
    ChannelIo::Handshaking => Err(SockError::InvalidState("TLS handshake in progress")),
    ChannelIo::Closed => Err(SockError::ConnectionReset),
    _ => Ok(()),
  }
}

/// Installs an already-negotiated stream (e.g. post-handshake TLS) and
/// starts its I/O tasks.
#[cfg(feature = "tls")]
pub(crate) fn install_io<S>(
  core: &Arc<SocketCore>,
  channel: &Arc<Channel>,
  stream: S,
) -> Result<(), SockError>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  let (writer_tx, writer_rx) = async_channel::unbounded();
  let read_cancel = channel.cancel.child_token();
  {
    let mut io = channel.io.lock();
    // The socket may have been closed while the handshake was in flight;
    // do not resurrect a closed channel.
    if matches!(*io, ChannelIo::Closed) {
      return Err(SockError::ConnectionReset);
    }
    *io = ChannelIo::ActiveStream {
      writer_tx,
      read_cancel: read_cancel.clone(),
    };
  }
  spawn_io(core.clone(), channel.clone(), stream, writer_rx, read_cancel)
}

/// Claims the pending stream for a TLS handshake.
#[cfg(feature = "tls")]
pub(crate) fn take_pending(channel: &Channel) -> Result<TcpStream, SockError> {
  let mut io = channel.io.lock();
  match &mut *io {
    ChannelIo::PendingStream(slot) => {
      let stream = slot.take().expect("pending stream present");
      *io = ChannelIo::Handshaking;
      Ok(stream)
    }
    ChannelIo::ActiveStream { .. } => Err(SockError::InvalidState("cannot wrap an active socket")),
    ChannelIo::Handshaking => Err(SockError::InvalidState("TLS handshake in progress")),
    _ => Err(SockError::InvalidState("not a stream channel")),
  }
}

/// Detaches the inbound side: the reader task stops, queued data remains.
pub(crate) fn cancel_reader(channel: &Channel) {
  if let ChannelIo::ActiveStream { read_cancel, .. } = &*channel.io.lock() {
    read_cancel.cancel();
  }
}

fn spawn_io<S>(
  core: Arc<SocketCore>,
  channel: Arc<Channel>,
  stream: S,
  writer_rx: async_channel::Receiver<WriteCmd>,
  read_cancel: CancellationToken,
) -> Result<(), SockError>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  let reactor = runtime::reactor()?;
  let (read_half, write_half) = tokio::io::split(stream);
  reactor.spawn(reader_loop(core.clone(), read_cancel, read_half));
  reactor.spawn(writer_loop(core, channel, write_half, writer_rx));
  Ok(())
}

async fn reader_loop<R>(core: Arc<SocketCore>, cancel: CancellationToken, mut rd: R)
where
  R: AsyncRead + Send + Unpin,
{
  let mut buf = BytesMut::with_capacity(READ_CHUNK);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        tracing::trace!(sock_id = core.id, "Reader task detached");
        return;
      }
      res = rd.read_buf(&mut buf) => match res {
        Ok(0) => {
          tracing::debug!(sock_id = core.id, "Peer closed channel");
          core.channel_closed.store(true, Ordering::SeqCst);
          core.incoming.push(InboundMsg::PeerClosed);
          core.notify_selectors(Notice::hangup());
          return;
        }
        Ok(n) => {
          tracing::trace!(sock_id = core.id, bytes = n, "Channel read");
          core.incoming.push(InboundMsg::Data(buf.split().freeze()));
          core.notify_selectors(Notice::default());
          buf.reserve(READ_CHUNK);
        }
        Err(e) => {
          tracing::debug!(sock_id = core.id, error = %e, "Channel read error");
          let err = SockError::from_io(e);
          core.latch_code(err.code());
          core.channel_closed.store(true, Ordering::SeqCst);
          core.incoming.push(InboundMsg::PeerClosed);
          core.notify_selectors(Notice::exception_and_hangup());
          return;
        }
      }
    }
  }
}

async fn writer_loop<W>(
  core: Arc<SocketCore>,
  channel: Arc<Channel>,
  mut wr: W,
  rx: async_channel::Receiver<WriteCmd>,
) where
  W: AsyncWrite + Send + Unpin,
{
  loop {
    let cmd = tokio::select! {
      _ = channel.cancel.cancelled() => break,
      cmd = rx.recv() => match cmd {
        Ok(cmd) => cmd,
        Err(_) => break,
      },
    };
    let WriteCmd { buf, done } = cmd;
    let res = async {
      wr.write_all(&buf).await?;
      wr.flush().await
    }
    .await;

    // Budget returns as soon as the bytes left the facade, success or not;
    // writability reflects queue space, not peer health.
    channel.write_budget.fetch_add(buf.len(), Ordering::SeqCst);
    {
      let _gate = channel.write_gate.lock();
      channel.write_cv.notify_all();
    }

    match res {
      Ok(()) => {
        tracing::trace!(sock_id = core.id, bytes = buf.len(), "Channel write flushed");
        if let Some(done) = done {
          done.set(Ok(()));
        }
        core.notify_selectors(Notice::default());
      }
      Err(e) => {
        tracing::debug!(sock_id = core.id, error = %e, "Channel write error");
        let err = SockError::from_io(e);
        core.latch_code(err.code());
        core.channel_closed.store(true, Ordering::SeqCst);
        if let Some(done) = done {
          done.set(Err(err));
        }
        core.notify_selectors(Notice::exception());
        break;
      }
    }
  }
  // Resolve any writes still queued so blocked senders observe the closure.
  while let Ok(WriteCmd { done, .. }) = rx.try_recv() {
    if let Some(done) = done {
      done.set(Err(SockError::ConnectionReset));
    }
  }
}

fn claim_budget(channel: &Channel, want: usize) -> usize {
  let mut claimed = 0;
  let _ = channel
    .write_budget
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
      if budget == 0 {
        None
      } else {
        claimed = budget.min(want);
        Some(budget - claimed)
      }
    });
  claimed
}

/// Writes at most the bytes the channel currently accepts without blocking
/// the reactor, returning a possibly-short count. Blocking/timeout rules
/// apply to the write-completion future, not to each byte.
pub(crate) fn send(
  core: &Arc<SocketCore>,
  channel: &Arc<Channel>,
  data: &[u8],
) -> Result<usize, SockError> {
  let timeout = core.timeout();
  let nonblocking = matches!(timeout, Some(d) if d.is_zero());
  let deadline = match timeout {
    Some(d) if !d.is_zero() => Some(Instant::now() + d),
    _ => None,
  };

  let claimed = loop {
    if core.channel_closed.load(Ordering::SeqCst) {
      return Err(SockError::ConnectionReset);
    }
    let claimed = claim_budget(channel, data.len());
    if claimed > 0 {
      break claimed;
    }
    if nonblocking {
      return Err(SockError::WouldBlock);
    }
    let mut gate = channel.write_gate.lock();
    // Re-check with the gate held so a wakeup between the claim attempt and
    // this wait is never lost.
    if channel.write_budget.load(Ordering::SeqCst) > 0 || core.channel_closed.load(Ordering::SeqCst) {
      continue;
    }
    match deadline {
      None => channel.write_cv.wait(&mut gate),
      Some(deadline) => {
        if channel.write_cv.wait_until(&mut gate, deadline).timed_out() {
          return Err(SockError::Timeout);
        }
      }
    }
  };

  let writer_tx = match &*channel.io.lock() {
    ChannelIo::ActiveStream { writer_tx, .. } => writer_tx.clone(),
    _ => {
      channel.write_budget.fetch_add(claimed, Ordering::SeqCst);
      return Err(SockError::NotConnected);
    }
  };

  let done = if nonblocking { None } else { Some(Completion::new()) };
  let cmd = WriteCmd {
    buf: Bytes::copy_from_slice(&data[..claimed]),
    done: done.clone(),
  };
  if writer_tx.send_blocking(cmd).is_err() {
    channel.write_budget.fetch_add(claimed, Ordering::SeqCst);
    return Err(SockError::ConnectionReset);
  }

  if let Some(done) = done {
    match done.wait(timeout) {
      Some(Ok(())) => {}
      Some(Err(e)) => return Err(e),
      None => return Err(SockError::Timeout),
    }
  }
  Ok(claimed)
}
