// tests/readiness.rs

use resock::{select, PollEvents, Poller, SockError};

use std::time::{Duration, Instant};

mod common;

#[test]
fn select_times_out_with_nothing_ready() {
  let (client, server) = common::connected_pair();
  let started = Instant::now();
  let (r, w, x) = select(&[&server], &[], &[], Some(Duration::from_millis(150))).unwrap();
  assert!(r.is_empty() && w.is_empty() && x.is_empty());
  assert!(started.elapsed() >= Duration::from_millis(150));
  drop(client);
}

#[test]
fn select_reports_levels_until_drained() {
  let (client, server) = common::connected_pair();
  client.sendall(b"ready").unwrap();

  let (r, _, _) = select(&[&server], &[], &[], Some(Duration::from_secs(2))).unwrap();
  assert_eq!(r, vec![server.id()]);

  // Still ready on a second call: level-triggered, not edge.
  let (r, _, _) = select(&[&server], &[], &[], Some(Duration::from_secs(2))).unwrap();
  assert_eq!(r, vec![server.id()]);

  let _ = common::recv_exact(&server, 5);
  let (r, _, _) = select(&[&server], &[], &[], Some(Duration::from_millis(100))).unwrap();
  assert!(r.is_empty());
}

#[test]
fn select_sees_writability_immediately() {
  let (client, _server) = common::connected_pair();
  let (_, w, _) = select(&[], &[&client], &[], Some(Duration::from_secs(1))).unwrap();
  assert_eq!(w, vec![client.id()]);
}

#[test]
fn select_wakes_on_data_arriving_mid_wait() {
  let (client, server) = common::connected_pair();
  let handle = std::thread::spawn(move || {
    std::thread::sleep(Duration::from_millis(120));
    client.sendall(b"wake").unwrap();
    client
  });
  let started = Instant::now();
  let (r, _, _) = select(&[&server], &[], &[], Some(Duration::from_secs(5))).unwrap();
  assert_eq!(r, vec![server.id()]);
  assert!(started.elapsed() < Duration::from_secs(5));
  let _client = handle.join().unwrap();
  let _ = common::recv_exact(&server, 4);
}

#[test]
fn poller_is_level_triggered_and_rearms() {
  let (client, server) = common::connected_pair();
  let poller = Poller::new();
  poller.register(&server, PollEvents::IN).unwrap();

  client.sendall(b"abcdef").unwrap();

  let events = poller.poll(Some(Duration::from_secs(2))).unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].0, server.id());
  assert!(events[0].1.contains(PollEvents::IN));

  // Reported again while the readiness condition is not consumed.
  let events = poller.poll(Some(Duration::from_secs(2))).unwrap();
  assert_eq!(events.len(), 1, "still-ready socket must be re-reported");

  let _ = common::recv_exact(&server, 6);
  let events = poller.poll(Some(Duration::from_millis(100))).unwrap();
  assert!(events.is_empty(), "drained socket must stop being reported");
}

#[test]
fn poller_never_misses_events_between_calls() {
  let (client, server) = common::connected_pair();
  let poller = Poller::new();
  poller.register(&server, PollEvents::IN).unwrap();

  // Drain the initial registration notification first.
  let _ = poller.poll(Some(Duration::from_millis(50))).unwrap();

  // Data arrives while nobody is polling.
  client.sendall(b"between calls").unwrap();
  std::thread::sleep(Duration::from_millis(100));

  let events = poller.poll(Some(Duration::from_secs(2))).unwrap();
  assert_eq!(events.len(), 1);
  assert!(events[0].1.contains(PollEvents::IN));
}

#[test]
fn poller_reports_writable_and_zero_timeout_drains() {
  let (client, _server) = common::connected_pair();
  let poller = Poller::new();
  poller.register(&client, PollEvents::OUT).unwrap();
  let events = poller.poll(Some(Duration::ZERO)).unwrap();
  assert_eq!(events.len(), 1);
  assert!(events[0].1.contains(PollEvents::OUT));
}

#[test]
fn poller_reports_hangup_after_peer_close() {
  let (client, server) = common::connected_pair();
  let poller = Poller::new();
  poller.register(&server, PollEvents::IN | PollEvents::HUP).unwrap();
  client.close();
  std::thread::sleep(Duration::from_millis(100));

  let events = poller.poll(Some(Duration::from_secs(2))).unwrap();
  assert_eq!(events.len(), 1);
  assert!(
    events[0].1.intersects(PollEvents::IN | PollEvents::HUP),
    "expected IN/HUP, got {:?}",
    events[0].1
  );
}

#[test]
fn poller_rejects_unknown_registrations() {
  let (client, server) = common::connected_pair();
  let poller = Poller::new();
  assert!(matches!(
    poller.modify(&server, PollEvents::IN).unwrap_err(),
    SockError::InvalidArgument(_)
  ));
  assert!(matches!(
    poller.unregister(&server).unwrap_err(),
    SockError::InvalidArgument(_)
  ));
  poller.register(&client, PollEvents::IN).unwrap();
  poller.modify(&client, PollEvents::IN | PollEvents::OUT).unwrap();
  poller.unregister(&client).unwrap();
}

#[test]
fn accept_readiness_via_select() {
  let (listener, addr) = common::stream_listener(4);
  let client = resock::Socket::new(resock::Family::Ipv4, resock::SockType::Stream).unwrap();
  client.set_timeout(Some(common::TEST_TIMEOUT)).unwrap();
  client.connect(addr).unwrap();

  let (r, _, _) = select(&[&listener], &[], &[], Some(Duration::from_secs(2))).unwrap();
  assert_eq!(r, vec![listener.id()]);
  let (_child, _) = listener.accept().unwrap();
}
