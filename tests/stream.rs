// tests/stream.rs

use resock::{ConnectStatus, Family, OptValue, SockError, SockType, Socket, SocketKind};

use serial_test::serial;
use std::net::Shutdown;
use std::time::{Duration, Instant};

mod common;

#[test]
fn roundtrip_send_recv() {
  let (client, server) = common::connected_pair();
  client.sendall(b"hello over the reactor").unwrap();
  let got = common::recv_exact(&server, 22);
  assert_eq!(got, b"hello over the reactor");

  server.sendall(b"and back").unwrap();
  let got = common::recv_exact(&client, 8);
  assert_eq!(got, b"and back");
}

#[test]
fn short_send_reports_written_count() {
  let (client, server) = common::connected_pair();
  let n = client.send(b"abc").unwrap();
  assert!(n >= 1 && n <= 3);
  let got = common::recv_exact(&server, n);
  assert_eq!(&got, &b"abc"[..n]);
}

#[test]
fn eof_is_latched_after_peer_close() {
  let (client, server) = common::connected_pair();
  client.sendall(b"bye").unwrap();
  client.close();

  let got = common::recv_exact(&server, 3);
  assert_eq!(got, b"bye");

  // Exactly one (possibly waiting) empty read at EOF.
  let eof = server.recv(64).unwrap();
  assert!(eof.is_empty());

  // Later reads return empty immediately, even in non-blocking mode.
  server.set_nonblocking(true).unwrap();
  let started = Instant::now();
  let again = server.recv(64).unwrap();
  assert!(again.is_empty());
  assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn nonblocking_recv_raises_would_block() {
  let (_client, server) = common::connected_pair();
  server.set_nonblocking(true).unwrap();
  assert_eq!(server.recv(16).unwrap_err(), SockError::WouldBlock);
}

#[test]
fn nonblocking_accept_raises_would_block() {
  let (listener, _addr) = common::stream_listener(4);
  listener.set_nonblocking(true).unwrap();
  assert_eq!(
    listener.accept().map(|_| ()).unwrap_err(),
    SockError::WouldBlock
  );
}

#[test]
#[serial]
fn recv_timeout_expires_within_bounds() {
  let (_client, server) = common::connected_pair();
  let timeout = Duration::from_millis(200);
  server.set_timeout(Some(timeout)).unwrap();
  let started = Instant::now();
  assert_eq!(server.recv(16).unwrap_err(), SockError::Timeout);
  let elapsed = started.elapsed();
  assert!(elapsed >= timeout, "returned early: {elapsed:?}");
  assert!(elapsed < timeout + Duration::from_millis(800), "returned late: {elapsed:?}");
}

#[test]
#[serial]
fn refused_connect_fails_within_timeout() {
  // Grab a port with no listener by binding and immediately closing.
  let (listener, addr) = common::stream_listener(1);
  listener.close();
  std::thread::sleep(Duration::from_millis(50));

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(Duration::from_secs(2))).unwrap();
  let started = Instant::now();
  let err = sock.connect(addr).unwrap_err();
  assert!(
    matches!(err, SockError::ConnectionRefused(_)),
    "expected refusal, got {err:?}"
  );
  assert!(started.elapsed() < Duration::from_secs(2));

  // The failure is latched for SO_ERROR, then cleared.
  let code = sock
    .get_option(resock::options::SOL_SOCKET, resock::options::SO_ERROR)
    .unwrap();
  assert_eq!(code, OptValue::Int(libc::ECONNREFUSED));
  let cleared = sock
    .get_option(resock::options::SOL_SOCKET, resock::options::SO_ERROR)
    .unwrap();
  assert_eq!(cleared, OptValue::Int(0));
}

#[test]
fn backlog_preserves_fifo_connect_order() {
  let (listener, addr) = common::stream_listener(1);

  let first = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  first.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  first.connect(addr).unwrap();
  first.sendall(b"1").unwrap();

  let second = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  second.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  second.connect(addr).unwrap();
  second.sendall(b"2").unwrap();

  let (child_a, _) = listener.accept().unwrap();
  child_a.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  assert_eq!(common::recv_exact(&child_a, 1), b"1");

  let (child_b, _) = listener.accept().unwrap();
  child_b.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  assert_eq!(common::recv_exact(&child_b, 1), b"2");
}

#[test]
fn dup_keeps_channel_open_until_last_close() {
  let (client, server) = common::connected_pair();
  let alias = client.dup().unwrap();

  client.close();
  // Data arriving between closes is still delivered to the live alias.
  server.sendall(b"still here").unwrap();
  assert_eq!(common::recv_exact(&alias, 10), b"still here");

  alias.close();
  // Now the channel really closed; the peer observes EOF.
  let eof = server.recv(16).unwrap();
  assert!(eof.is_empty());
}

#[test]
fn closed_handle_rejects_operations() {
  let (client, _server) = common::connected_pair();
  client.close();
  assert_eq!(client.recv(1).unwrap_err(), SockError::Closed);
  assert_eq!(client.send(b"x").unwrap_err(), SockError::Closed);
  assert!(client.dup().is_err());
  // close is idempotent per handle
  client.close();
}

#[test]
fn shutdown_write_blocks_send_keeps_recv() {
  let (client, server) = common::connected_pair();
  client.shutdown(Shutdown::Write).unwrap();
  assert_eq!(client.send(b"x").unwrap_err(), SockError::NotConnected);

  server.sendall(b"inbound ok").unwrap();
  assert_eq!(common::recv_exact(&client, 10), b"inbound ok");
}

#[test]
fn connect_twice_fails_already_connected() {
  let (_listener, addr) = common::stream_listener(4);
  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  sock.connect(addr).unwrap();
  assert_eq!(sock.connect(addr).unwrap_err(), SockError::AlreadyConnected);
}

#[test]
fn connect_ex_progresses_to_isconn() {
  let (_listener, addr) = common::stream_listener(4);
  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_nonblocking(true).unwrap();

  let mut status = sock.connect_ex(addr);
  assert!(
    matches!(status, ConnectStatus::InProgress | ConnectStatus::Connected),
    "unexpected first status {status:?}"
  );
  let deadline = Instant::now() + Duration::from_secs(2);
  while !status.is_connected() {
    assert!(Instant::now() < deadline, "connect never completed: {status:?}");
    assert!(
      matches!(status, ConnectStatus::InProgress | ConnectStatus::Already),
      "unexpected status {status:?}"
    );
    std::thread::sleep(Duration::from_millis(10));
    status = sock.connect_ex(addr);
  }
  assert_eq!(status.errno(), libc::EISCONN);
}

#[test]
fn addresses_are_reported() {
  let (client, server) = common::connected_pair();
  let client_local = client.local_addr().unwrap();
  let server_peer = server.peer_addr().unwrap();
  assert_eq!(client_local, server_peer);
  assert!(client.peer_addr().unwrap().port() > 0);
  assert_eq!(client.kind(), SocketKind::Client);
}

#[test]
fn unsupported_option_leaves_store_untouched() {
  let (client, _server) = common::connected_pair();
  client
    .set_option(resock::options::SOL_SOCKET, resock::options::SO_KEEPALIVE, OptValue::Bool(true))
    .unwrap();
  let err = client
    .set_option(resock::options::SOL_SOCKET, libc::SO_OOBINLINE, OptValue::Bool(true))
    .unwrap_err();
  assert!(matches!(err, SockError::ProtocolNotAvailable(_, _)));
  assert_eq!(
    client
      .get_option(resock::options::SOL_SOCKET, resock::options::SO_KEEPALIVE)
      .unwrap(),
    OptValue::Bool(true)
  );
}

#[test]
fn pseudo_options_are_computed() {
  let (listener, _addr) = common::stream_listener(2);
  assert_eq!(
    listener
      .get_option(resock::options::SOL_SOCKET, resock::options::SO_ACCEPTCONN)
      .unwrap(),
    OptValue::Bool(true)
  );
  assert_eq!(
    listener
      .get_option(resock::options::SOL_SOCKET, resock::options::SO_TYPE)
      .unwrap(),
    OptValue::Int(libc::SOCK_STREAM)
  );
}

#[test]
fn timeout_option_aliases_socket_timeout() {
  let (client, _server) = common::connected_pair();
  client
    .set_option(resock::options::SOL_SOCKET, resock::options::SO_RCVTIMEO, OptValue::Int(1500))
    .unwrap();
  assert_eq!(client.timeout().unwrap(), Some(Duration::from_millis(1500)));
  assert_eq!(
    client
      .get_option(resock::options::SOL_SOCKET, resock::options::SO_RCVTIMEO)
      .unwrap(),
    OptValue::Int(1500)
  );
}

#[test]
fn create_connection_connects_and_times() {
  let (listener, addr) = common::stream_listener(4);
  let sock = resock::create_connection(
    ("127.0.0.1", addr.port()),
    Some(Duration::from_secs(2)),
    None,
  )
  .unwrap();
  let (child, _) = listener.accept().unwrap();
  sock.sendall(b"cc").unwrap();
  child.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  assert_eq!(common::recv_exact(&child, 2), b"cc");
  assert_eq!(sock.timeout().unwrap(), Some(Duration::from_secs(2)));
}
