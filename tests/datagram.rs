// tests/datagram.rs

use resock::{Family, OptValue, SockError, SockType, Socket, SocketKind};

use serial_test::serial;
use std::time::{Duration, Instant};

mod common;

#[test]
fn sendto_recvfrom_roundtrip() {
  let (a, a_addr) = common::udp_socket();
  let (b, b_addr) = common::udp_socket();

  let sent = a.sendto(b"ping", b_addr).unwrap();
  assert_eq!(sent, 4);

  let (data, from) = b.recvfrom(1024).unwrap();
  assert_eq!(&data[..], b"ping");
  assert_eq!(from, a_addr);
}

#[test]
fn connected_datagram_send_recv() {
  let (a, a_addr) = common::udp_socket();
  let (b, b_addr) = common::udp_socket();

  a.connect(b_addr).unwrap();
  assert_eq!(a.kind(), SocketKind::Datagram);
  assert_eq!(a.peer_addr().unwrap(), b_addr);

  let sent = a.send(b"hello").unwrap();
  assert_eq!(sent, 5);
  let (data, from) = b.recvfrom(64).unwrap();
  assert_eq!(&data[..], b"hello");
  assert_eq!(from, a_addr);

  b.sendto(b"reply", a_addr).unwrap();
  let data = a.recv(64).unwrap();
  assert_eq!(&data[..], b"reply");
}

#[test]
fn nonblocking_recvfrom_raises_would_block() {
  let (a, _addr) = common::udp_socket();
  a.set_nonblocking(true).unwrap();
  assert_eq!(a.recvfrom(64).map(|_| ()).unwrap_err(), SockError::WouldBlock);
}

#[test]
#[serial]
fn recvfrom_timeout_expires_within_bounds() {
  let (a, _addr) = common::udp_socket();
  let timeout = Duration::from_millis(200);
  a.set_timeout(Some(timeout)).unwrap();
  let started = Instant::now();
  assert_eq!(a.recvfrom(64).map(|_| ()).unwrap_err(), SockError::Timeout);
  let elapsed = started.elapsed();
  assert!(elapsed >= timeout);
  assert!(elapsed < timeout + Duration::from_millis(800));
}

#[test]
fn send_without_peer_fails_not_connected() {
  let (a, _addr) = common::udp_socket();
  assert_eq!(a.send(b"x").unwrap_err(), SockError::NotConnected);
}

#[test]
fn broadcast_is_allowed_and_tcp_options_are_not() {
  let (a, _addr) = common::udp_socket();
  a.set_option(resock::options::SOL_SOCKET, resock::options::SO_BROADCAST, OptValue::Bool(true))
    .unwrap();
  let err = a
    .set_option(resock::options::IPPROTO_TCP, resock::options::TCP_NODELAY, OptValue::Bool(true))
    .unwrap_err();
  assert!(matches!(err, SockError::ProtocolNotAvailable(_, _)));
  assert_eq!(
    a.get_option(resock::options::SOL_SOCKET, resock::options::SO_TYPE).unwrap(),
    OptValue::Int(libc::SOCK_DGRAM)
  );
}

#[test]
fn sendto_on_stream_socket_is_invalid() {
  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  assert!(matches!(
    sock.sendto(b"x", ("127.0.0.1", 9)).unwrap_err(),
    SockError::InvalidState(_)
  ));
}

#[test]
fn first_datagram_io_commits_the_kind() {
  let sock = Socket::new(Family::Ipv4, SockType::Datagram).unwrap();
  assert_eq!(sock.kind(), SocketKind::Unassigned);
  sock.set_nonblocking(true).unwrap();
  // recv on a fresh datagram socket binds it implicitly.
  let _ = sock.recv(16);
  assert_eq!(sock.kind(), SocketKind::Datagram);
  assert!(sock.local_addr().is_ok());
}
