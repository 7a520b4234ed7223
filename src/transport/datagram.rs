//! Datagram (UDP) channel: deferred bind, whole-message sends, and the
//! reader task feeding the inbound queue.

use crate::error::SockError;
use crate::ready::Notice;
use crate::runtime;
use crate::socket::core::{InboundMsg, SocketCore, SocketKind};
use crate::transport::{dup_fd_of, Channel, ChannelIo, ChannelKind, MAX_DATAGRAM};

use bytes::Bytes;
use socket2::{Domain, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Creates the datagram channel on first use (bind, connect, send, or
/// recv), binding to the stored address or the family wildcard.
pub(crate) fn ensure_channel(core: &Arc<SocketCore>) -> Result<Arc<Channel>, SockError> {
  let reactor = runtime::reactor()?;

  let (channel, udp) = {
    let mut slot = core.channel.write();
    if let Some(existing) = slot.as_ref() {
      return Ok(existing.clone());
    }

    let bind = core
      .bind_addr
      .read()
      .unwrap_or_else(|| SocketAddr::new(core.family.wildcard_ip(), 0));
    let domain = if bind.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };

    let sock = RawSocket::new(domain, Type::DGRAM, None).map_err(SockError::from_io)?;
    let fd = dup_fd_of(&sock)?;
    core.options.apply_all(&fd)?;
    sock
      .bind(&bind.into())
      .map_err(|e| SockError::from_io_endpoint(e, &bind.to_string()))?;
    sock.set_nonblocking(true).map_err(SockError::from_io)?;
    let local = sock
      .local_addr()
      .map_err(SockError::from_io)?
      .as_socket()
      .ok_or_else(|| SockError::Internal("datagram socket bound to a non-inet address".into()))?;

    let std_sock: std::net::UdpSocket = sock.into();
    let udp = {
      let _guard = reactor.enter();
      Arc::new(UdpSocket::from_std(std_sock).map_err(SockError::from_io)?)
    };
    let channel = Channel::new(
      ChannelKind::Datagram,
      fd,
      Some(local),
      None,
      ChannelIo::Datagram { sock: udp.clone() },
    );
    *slot = Some(channel.clone());
    tracing::debug!(sock_id = core.id, local_addr = %local, "Datagram channel bound");
    (channel, udp)
  };

  *core.kind.write() = SocketKind::Datagram;
  reactor.spawn(reader_loop(core.clone(), channel.clone(), udp));
  Ok(channel)
}

/// Sets the default peer of a connected datagram socket.
pub(crate) fn connect(core: &Arc<SocketCore>, addr: SocketAddr) -> Result<(), SockError> {
  let channel = ensure_channel(core)?;
  let udp = channel
    .udp()
    .ok_or(SockError::InvalidState("channel is not a datagram channel"))?;
  let reactor = runtime::reactor()?;
  // UDP connect is a local operation; it resolves immediately and is safe
  // for non-blocking sockets too.
  reactor.run_with_timeout(None, async move {
    udp.connect(addr).await.map_err(SockError::from_io)
  })?;
  *channel.peer_addr.write() = Some(addr);
  tracing::debug!(sock_id = core.id, peer = %addr, "Datagram socket connected");
  Ok(())
}

/// Sends one whole datagram under the timeout contract.
pub(crate) fn send_to(
  core: &Arc<SocketCore>,
  channel: &Arc<Channel>,
  data: &[u8],
  addr: SocketAddr,
) -> Result<usize, SockError> {
  let udp = channel
    .udp()
    .ok_or(SockError::InvalidState("channel is not a datagram channel"))?;
  let timeout = core.timeout();
  if matches!(timeout, Some(d) if d.is_zero()) {
    return udp.try_send_to(data, addr).map_err(SockError::from_io);
  }
  let reactor = runtime::reactor()?;
  let payload = Bytes::copy_from_slice(data);
  reactor.run_with_timeout(timeout, async move {
    udp.send_to(&payload, addr).await.map_err(SockError::from_io)
  })
}

async fn reader_loop(core: Arc<SocketCore>, channel: Arc<Channel>, udp: Arc<UdpSocket>) {
  let cancel = channel.cancel.clone();
  let mut buf = vec![0u8; MAX_DATAGRAM];
  loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        tracing::trace!(sock_id = core.id, "Datagram reader stopped");
        return;
      }
      res = udp.recv_from(&mut buf) => match res {
        Ok((n, from)) => {
          tracing::trace!(sock_id = core.id, bytes = n, %from, "Datagram received");
          core.incoming.push(InboundMsg::DatagramFrom {
            data: Bytes::copy_from_slice(&buf[..n]),
            from,
          });
          core.notify_selectors(Notice::default());
        }
        Err(e) => {
          // Connected datagram sockets surface ICMP errors here; latch and
          // keep receiving.
          tracing::debug!(sock_id = core.id, error = %e, "Datagram receive error");
          core.latch_code(SockError::from_io(e).code());
          core.notify_selectors(Notice::exception());
          tokio::time::sleep(Duration::from_millis(10)).await;
        }
      }
    }
  }
}
