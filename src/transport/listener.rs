//! Listening channel: socket2 bind/listen plus the reactor accept loop.

use crate::error::SockError;
use crate::ready::Notice;
use crate::runtime::{self, WaitQueue};
use crate::socket::core::{AcceptedChild, ServerShared, SocketCore};
use crate::transport::{dup_fd_of, stream, Channel, ChannelIo, ChannelKind};

use parking_lot::Mutex;
use socket2::{Domain, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Binds the listening channel and spawns the accept loop. The backlog is a
/// bounded queue filled asynchronously by the reactor; when it is full the
/// loop stops accepting instead of blocking a reactor thread.
pub(crate) fn start(core: &Arc<SocketCore>, backlog: usize) -> Result<Arc<ServerShared>, SockError> {
  let reactor = runtime::reactor()?;

  let bind = core
    .bind_addr
    .read()
    .unwrap_or_else(|| SocketAddr::new(core.family.wildcard_ip(), 0));
  let domain = if bind.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };

  let sock = RawSocket::new(domain, Type::STREAM, None).map_err(SockError::from_io)?;
  let fd = dup_fd_of(&sock)?;
  core.options.apply_all(&fd)?;
  sock
    .bind(&bind.into())
    .map_err(|e| SockError::from_io_endpoint(e, &bind.to_string()))?;
  sock.listen(backlog.max(1) as i32).map_err(SockError::from_io)?;
  sock.set_nonblocking(true).map_err(SockError::from_io)?;

  let local = sock
    .local_addr()
    .map_err(SockError::from_io)?
    .as_socket()
    .ok_or_else(|| SockError::Internal("listener bound to a non-inet address".into()))?;

  let std_listener: std::net::TcpListener = sock.into();
  let listener = {
    let _guard = reactor.enter();
    TcpListener::from_std(std_listener).map_err(SockError::from_io)?
  };

  let channel = Channel::new(ChannelKind::Listener, fd, Some(local), None, ChannelIo::Listener);
  let acceptor_cancel = channel.cancel.clone();
  core.install_channel(channel);

  let server = Arc::new(ServerShared {
    backlog: WaitQueue::bounded(backlog.max(1)),
    accepted_children: Mutex::new(1),
    local_addr: local,
  });

  tracing::info!(sock_id = core.id, local_addr = %local, backlog, "Listener bound");
  reactor.spawn(accept_loop(core.clone(), server.clone(), listener, acceptor_cancel));
  Ok(server)
}

async fn accept_loop(
  parent: Arc<SocketCore>,
  server: Arc<ServerShared>,
  listener: TcpListener,
  cancel: CancellationToken,
) {
  loop {
    if !server.backlog.has_room() {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = server.backlog.wait_for_room() => {}
      }
    }
    let (stream, peer) = tokio::select! {
      _ = cancel.cancelled() => break,
      res = listener.accept() => match res {
        Ok(pair) => pair,
        Err(e) => {
          tracing::warn!(sock_id = parent.id, error = %e, "Accept failed, backing off");
          tokio::time::sleep(Duration::from_millis(100)).await;
          continue;
        }
      }
    };
    match prepare_child(&parent, &server, stream, peer) {
      Ok(child) => {
        tracing::debug!(sock_id = parent.id, child_id = child.id, %peer, "Queued accepted child");
        server.backlog.push(AcceptedChild { core: child, peer });
        parent.notify_selectors(Notice::default());
      }
      Err(e) => {
        tracing::warn!(sock_id = parent.id, %peer, error = %e, "Failed to set up accepted child");
      }
    }
  }
  tracing::debug!(sock_id = parent.id, "Accept loop stopped");
}

/// Builds the child core for a fresh connection: pending channel, options
/// copied from the parent at this moment so later divergence is independent.
fn prepare_child(
  parent: &Arc<SocketCore>,
  server: &Arc<ServerShared>,
  stream: TcpStream,
  peer: SocketAddr,
) -> Result<Arc<SocketCore>, SockError> {
  let fd = dup_fd_of(&stream)?;
  let channel = stream::make_channel(stream, fd)?;
  let child = SocketCore::new_child(parent, channel.clone(), server.clone());
  child.options.apply_all(&channel.fd)?;
  tracing::trace!(child_id = child.id, %peer, "Child channel initialized");
  Ok(child)
}
