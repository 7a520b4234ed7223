// tests/tls.rs
#![cfg(feature = "tls")]

use resock::{
  Family, HandshakeState, SockError, SockType, Socket, TlsContext, TlsErrorKind, WrapOptions,
};

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

mod common;

fn server_context() -> TlsContext {
  TlsContext::server(&common::fixture("cert.pem"), &common::fixture("key.pem")).unwrap()
}

fn client_context() -> TlsContext {
  TlsContext::client()
    .with_ca_file(common::fixture("cert.pem"))
    .build()
    .unwrap()
}

fn wrap_options() -> WrapOptions {
  WrapOptions {
    server_name: Some("localhost".into()),
    handshake_on_connect: true,
  }
}

/// TLS echo server: accepts one wrapped child, echoes one message.
fn spawn_tls_echo(handshake_on_connect: bool) -> (SocketAddr, thread::JoinHandle<()>) {
  let (listener, addr) = common::stream_listener(4);
  let context = server_context();
  let wrapped = context
    .wrap_socket(listener, WrapOptions {
      server_name: None,
      handshake_on_connect,
    })
    .unwrap();
  let handle = thread::spawn(move || {
    let (child, _peer) = wrapped.accept().expect("tls accept");
    child.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
    let data = child.recv(1024).expect("tls server recv");
    child.sendall(&data).expect("tls server send");
  });
  (addr, handle)
}

#[test]
fn handshake_and_echo_roundtrip() {
  common::setup_tracing();
  let (addr, server) = spawn_tls_echo(true);

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  let tls = client_context().wrap_socket(sock, wrap_options()).unwrap();
  assert_eq!(tls.handshake_state(), HandshakeState::NotStarted);

  tls.connect(addr).unwrap();
  assert_eq!(tls.handshake_state(), HandshakeState::Complete);

  tls.sendall(b"over tls").unwrap();
  let echoed = tls.recv(1024).unwrap();
  assert_eq!(&echoed[..], b"over tls");

  // Session facts are captured once the handshake completed.
  assert!(tls.cipher().is_some());
  assert!(matches!(tls.protocol_version(), Some("TLSv1.2") | Some("TLSv1.3")));
  let certs = tls.peer_certificates().unwrap();
  assert!(!certs.is_empty());

  server.join().unwrap();
}

#[test]
fn implicit_handshake_from_first_data_op() {
  common::setup_tracing();
  let (addr, server) = spawn_tls_echo(false);

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  let tls = client_context()
    .wrap_socket(sock, WrapOptions {
      server_name: Some("localhost".into()),
      handshake_on_connect: false,
    })
    .unwrap();

  tls.connect(addr).unwrap();
  // No handshake yet; the first application-data call forces it.
  assert_eq!(tls.handshake_state(), HandshakeState::NotStarted);
  tls.sendall(b"implicit").unwrap();
  assert_eq!(tls.handshake_state(), HandshakeState::Complete);
  let echoed = tls.recv(1024).unwrap();
  assert_eq!(&echoed[..], b"implicit");

  server.join().unwrap();
}

#[test]
fn unverifiable_peer_fails_handshake() {
  common::setup_tracing();
  let (addr, server) = spawn_tls_echo(true);

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  // Default WebPKI roots do not include the self-signed test certificate.
  let tls = TlsContext::client()
    .build()
    .unwrap()
    .wrap_socket(sock, wrap_options())
    .unwrap();

  let err = tls.connect(addr).unwrap_err();
  match err {
    SockError::Tls { kind, .. } => assert_eq!(kind, TlsErrorKind::PeerUnverified),
    other => panic!("expected TLS error, got {other:?}"),
  }
  assert_eq!(tls.handshake_state(), HandshakeState::Failed);
  drop(server); // server side fails too; don't insist on its outcome
}

#[test]
fn plaintext_peer_fails_with_tls_error() {
  common::setup_tracing();
  let (listener, addr) = common::stream_listener(4);
  let server = thread::spawn(move || {
    let (child, _) = listener.accept().expect("accept");
    child.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
    // Not a TLS record in any way.
    let _ = child.sendall(b"HTTP/1.1 400 Bad Request\r\n\r\n");
    let _ = child.recv(1024);
  });

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  sock.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  let tls = client_context().wrap_socket(sock, wrap_options()).unwrap();
  let err = tls.connect(addr).unwrap_err();
  assert!(
    matches!(err, SockError::Tls { .. }),
    "expected a TLS taxonomy error, got {err:?}"
  );
  server.join().unwrap();
}

#[test]
fn wrapping_an_active_socket_is_rejected() {
  let (client, _server) = common::connected_pair();
  client.set_nonblocking(true).unwrap();
  let _ = client.recv(1); // activates the channel's I/O tasks
  let err = client_context().wrap_socket(client, wrap_options()).unwrap_err();
  assert!(matches!(err, SockError::InvalidState(_)));
}

#[test]
fn wrapping_a_datagram_socket_is_rejected() {
  let (sock, _addr) = common::udp_socket();
  let err = client_context().wrap_socket(sock, wrap_options()).unwrap_err();
  assert!(matches!(err, SockError::InvalidState(_)));
}

#[test]
fn server_context_cannot_connect_and_client_cannot_accept() {
  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  let tls = server_context().wrap_socket(sock, WrapOptions::default()).unwrap();
  assert!(matches!(
    tls.connect(("127.0.0.1", 1)).unwrap_err(),
    SockError::InvalidState(_)
  ));

  let sock = Socket::new(Family::Ipv4, SockType::Stream).unwrap();
  let tls = client_context().wrap_socket(sock, WrapOptions::default()).unwrap();
  assert!(matches!(tls.accept().unwrap_err(), SockError::InvalidState(_)));
}
