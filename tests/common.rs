// tests/common.rs
#![allow(dead_code)] // Not every test binary uses every helper

use resock::{Family, SockType, Socket};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

static TRACING_INIT: Once = Once::new();

/// Default bound for every blocking call in tests, so a regression hangs a
/// test for seconds instead of forever.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    let default_filter = "resock=debug,warn";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_test_writer()
      .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
  });
}

/// A listening stream socket on an ephemeral loopback port.
pub fn stream_listener(backlog: usize) -> (Socket, SocketAddr) {
  setup_tracing();
  let sock = Socket::new(Family::Ipv4, SockType::Stream).expect("create listener");
  sock.set_timeout(Some(TEST_TIMEOUT)).unwrap();
  sock.bind(("127.0.0.1", 0)).expect("bind listener");
  sock.listen(backlog).expect("listen");
  let addr = sock.local_addr().expect("listener local addr");
  (sock, addr)
}

/// A connected (client, server-side child) pair, both with the test timeout.
pub fn connected_pair() -> (Socket, Socket) {
  let (listener, addr) = stream_listener(8);
  let client = Socket::new(Family::Ipv4, SockType::Stream).expect("create client");
  client.set_timeout(Some(TEST_TIMEOUT)).unwrap();
  client.connect(addr).expect("connect");
  let (child, _peer) = listener.accept().expect("accept");
  child.set_timeout(Some(TEST_TIMEOUT)).unwrap();
  (client, child)
}

/// Reads until exactly `n` bytes arrived. Panics on EOF or timeout.
pub fn recv_exact(sock: &Socket, n: usize) -> Vec<u8> {
  let mut out = Vec::with_capacity(n);
  while out.len() < n {
    let chunk = sock.recv(n - out.len()).expect("recv");
    assert!(!chunk.is_empty(), "unexpected EOF after {} bytes", out.len());
    out.extend_from_slice(&chunk);
  }
  out
}

/// A bound datagram socket on an ephemeral loopback port.
pub fn udp_socket() -> (Socket, SocketAddr) {
  setup_tracing();
  let sock = Socket::new(Family::Ipv4, SockType::Datagram).expect("create datagram socket");
  sock.set_timeout(Some(TEST_TIMEOUT)).unwrap();
  sock.bind(("127.0.0.1", 0)).expect("bind datagram socket");
  let addr = sock.local_addr().expect("datagram local addr");
  (sock, addr)
}

pub fn fixture(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}
