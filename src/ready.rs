//! Level-triggered readiness over edge notifications.
//!
//! Channels push a notification at every readiness-affecting transition
//! (connect completed, data arrived, became writable, error, hangup).
//! `poll`/`select` never trust the notification alone: they re-evaluate the
//! socket's actual readiness on each wake, and re-arm reported sockets with
//! a synthetic self-notification so a still-ready socket is reported again
//! on the next call.

use crate::error::SockError;
use crate::runtime::{PopError, WaitQueue};
use crate::socket::core::SocketCore;
use crate::socket::Socket;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
  /// Poll event mask. Values match the classic poll constants.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct PollEvents: u16 {
    const IN   = 1;
    const OUT  = 2;
    /// Accepted in masks for compatibility; never reported.
    const PRI  = 4;
    const ERR  = 8;
    const HUP  = 16;
    /// Polled while no channel exists.
    const NVAL = 32;
  }
}

/// What a readiness-affecting event carried, beyond "something changed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Notice {
  pub exception: bool,
  pub hangup: bool,
}

impl Notice {
  pub fn exception() -> Self {
    Self {
      exception: true,
      hangup: false,
    }
  }

  pub fn hangup() -> Self {
    Self {
      exception: false,
      hangup: true,
    }
  }

  pub fn exception_and_hangup() -> Self {
    Self {
      exception: true,
      hangup: true,
    }
  }
}

/// An observer attached to one or more sockets.
pub(crate) trait SelectorSink: Send + Sync {
  fn notify(&self, sock: &Arc<SocketCore>, notice: Notice);
}

/// Observer list of a socket. Snapshot-iterated so notification is never
/// invalidated by a concurrent register/unregister.
pub(crate) struct SelectorList {
  inner: RwLock<Vec<Arc<dyn SelectorSink>>>,
}

impl std::fmt::Debug for SelectorList {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "SelectorList(len={})", self.inner.read().len())
  }
}

impl SelectorList {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(Vec::new()),
    }
  }

  /// Adds an observer unless the same observer is already registered. A
  /// socket may be watched by multiple observers simultaneously.
  pub fn add(&self, sink: Arc<dyn SelectorSink>) {
    let mut list = self.inner.write();
    if !list.iter().any(|s| Arc::ptr_eq(s, &sink)) {
      list.push(sink);
    }
  }

  pub fn remove(&self, sink: &Arc<dyn SelectorSink>) {
    self.inner.write().retain(|s| !Arc::ptr_eq(s, sink));
  }

  pub fn snapshot(&self) -> Vec<Arc<dyn SelectorSink>> {
    self.inner.read().clone()
  }
}

struct Notification {
  sock: Arc<SocketCore>,
  notice: Notice,
}

struct PollerShared {
  queue: WaitQueue<Notification>,
}

impl SelectorSink for PollerShared {
  fn notify(&self, sock: &Arc<SocketCore>, notice: Notice) {
    self.queue.push(Notification {
      sock: sock.clone(),
      notice,
    });
  }
}

/// Re-evaluates a socket's current readiness against the requested mask.
/// This, not the presence of a notification, decides the poll result.
fn event_test(sock: &Arc<SocketCore>, notice: Notice, mask: PollEvents) -> PollEvents {
  let mut events = PollEvents::empty();
  if mask.contains(PollEvents::IN) && sock.readable() {
    events |= PollEvents::IN;
  }
  if mask.contains(PollEvents::OUT) && sock.writable() {
    events |= PollEvents::OUT;
  }
  if mask.contains(PollEvents::ERR) && notice.exception {
    events |= PollEvents::ERR;
  }
  if mask.contains(PollEvents::HUP) && (notice.hangup || sock.channel_closed.load(Ordering::SeqCst)) {
    events |= PollEvents::HUP;
  }
  if mask.contains(PollEvents::NVAL) && sock.channel_ref().is_none() {
    events |= PollEvents::NVAL;
  }
  events
}

/// The poll-style readiness registry.
pub struct Poller {
  shared: Arc<PollerShared>,
  registered: Mutex<HashMap<u64, (Arc<SocketCore>, PollEvents)>>,
}

impl Default for Poller {
  fn default() -> Self {
    Self::new()
  }
}

impl Poller {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(PollerShared {
        queue: WaitQueue::unbounded(),
      }),
      registered: Mutex::new(HashMap::new()),
    }
  }

  /// Watches a socket for the given events. Returns the registration key
  /// (the socket id) reported by `poll`.
  pub fn register(&self, sock: &Socket, events: PollEvents) -> Result<u64, SockError> {
    let core = sock.core_ref()?.clone();
    // Watching a pending child implies the wrap decision is made; start
    // its channel so readiness is observable.
    let _ = core.ensure_active();
    self.registered.lock().insert(core.id, (core.clone(), events));
    let sink: Arc<dyn SelectorSink> = self.shared.clone();
    core.selectors.add(sink);
    // Initial self-notification so an already-ready socket is reported.
    self.shared.notify(&core, Notice::default());
    Ok(core.id)
  }

  pub fn modify(&self, sock: &Socket, events: PollEvents) -> Result<(), SockError> {
    let core = sock.core_ref()?;
    let mut registered = self.registered.lock();
    match registered.get_mut(&core.id) {
      Some(entry) => {
        entry.1 = events;
        Ok(())
      }
      None => Err(SockError::InvalidArgument("socket is not registered".into())),
    }
  }

  pub fn unregister(&self, sock: &Socket) -> Result<(), SockError> {
    let core = sock.core_ref()?;
    let removed = self.registered.lock().remove(&core.id);
    match removed {
      Some((core, _)) => {
        let sink: Arc<dyn SelectorSink> = self.shared.clone();
        core.selectors.remove(&sink);
        Ok(())
      }
      None => Err(SockError::InvalidArgument("socket is not registered".into())),
    }
  }

  /// Waits for readiness under the timeout contract and returns
  /// `(socket id, events)` pairs. `Some(ZERO)` degrades to a single
  /// non-blocking drain; `None` blocks until something is ready.
  pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<(u64, PollEvents)>, SockError> {
    let deadline = match timeout {
      Some(d) if !d.is_zero() => Some(Instant::now() + d),
      _ => None,
    };
    let nonblocking = matches!(timeout, Some(d) if d.is_zero());

    loop {
      let first = if nonblocking {
        match self.shared.queue.try_pop() {
          Some(notification) => notification,
          None => return Ok(Vec::new()),
        }
      } else {
        let wait = match deadline {
          None => None,
          Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
              return Ok(Vec::new());
            }
            Some(deadline - now)
          }
        };
        match self.shared.queue.pop(wait) {
          Ok(notification) => notification,
          Err(PopError::TimedOut) | Err(PopError::Empty) => return Ok(Vec::new()),
        }
      };

      // Pull everything else currently queued; edges may have coalesced.
      let mut notifications = vec![first];
      while let Some(notification) = self.shared.queue.try_pop() {
        notifications.push(notification);
      }

      let registered = self.registered.lock();
      let mut results = Vec::new();
      let mut reported: Vec<Arc<SocketCore>> = Vec::new();
      for notification in notifications {
        if reported.iter().any(|s| s.id == notification.sock.id) {
          continue;
        }
        // Concurrently unregistered sockets are simply ignored.
        let Some((_, mask)) = registered.get(&notification.sock.id) else {
          continue;
        };
        let events = event_test(&notification.sock, notification.notice, *mask);
        if !events.is_empty() {
          results.push((notification.sock.id, events));
          reported.push(notification.sock);
        }
      }
      drop(registered);

      // Re-arm reported sockets so a still-ready socket shows up on the
      // next call (level triggering).
      for sock in reported {
        self.shared.notify(&sock, Notice::default());
      }

      if !results.is_empty() {
        return Ok(results);
      }
      if nonblocking {
        return Ok(Vec::new());
      }
    }
  }
}

struct SelectWaiter {
  signaled: Mutex<bool>,
  cv: Condvar,
}

impl SelectorSink for SelectWaiter {
  fn notify(&self, _sock: &Arc<SocketCore>, _notice: Notice) {
    let mut signaled = self.signaled.lock();
    *signaled = true;
    self.cv.notify_all();
  }
}

/// POSIX-style `select`: blocks until any watched socket satisfies its
/// readiness predicate, re-testing levels on every wake. Returns the ready
/// socket ids for the read and write lists; the exceptional list is
/// accepted but never reported.
pub fn select(
  rlist: &[&Socket],
  wlist: &[&Socket],
  xlist: &[&Socket],
  timeout: Option<Duration>,
) -> Result<(Vec<u64>, Vec<u64>, Vec<u64>), SockError> {
  let waiter = Arc::new(SelectWaiter {
    signaled: Mutex::new(false),
    cv: Condvar::new(),
  });
  let sink: Arc<dyn SelectorSink> = waiter.clone();

  let mut watched: HashMap<u64, Arc<SocketCore>> = HashMap::new();
  for sock in rlist.iter().chain(wlist).chain(xlist) {
    let core = sock.core_ref()?.clone();
    let _ = core.ensure_active();
    watched.insert(core.id, core);
  }
  for core in watched.values() {
    core.selectors.add(sink.clone());
  }

  let result = select_loop(&waiter, rlist, wlist, timeout);

  for core in watched.values() {
    core.selectors.remove(&sink);
  }
  result
}

fn select_loop(
  waiter: &Arc<SelectWaiter>,
  rlist: &[&Socket],
  wlist: &[&Socket],
  timeout: Option<Duration>,
) -> Result<(Vec<u64>, Vec<u64>, Vec<u64>), SockError> {
  let deadline = match timeout {
    Some(d) if !d.is_zero() => Some(Instant::now() + d),
    _ => None,
  };
  let nonblocking = matches!(timeout, Some(d) if d.is_zero());

  loop {
    // Testing actual readiness converts edge notifications into levels,
    // and short-circuits if a socket was ready before the call.
    let mut ready_r = Vec::new();
    for sock in rlist {
      let core = sock.core_ref()?;
      if core.readable() {
        ready_r.push(core.id);
      }
    }
    let mut ready_w = Vec::new();
    for sock in wlist {
      let core = sock.core_ref()?;
      if core.writable() {
        ready_w.push(core.id);
      }
    }

    if !ready_r.is_empty() || !ready_w.is_empty() || nonblocking {
      return Ok((ready_r, ready_w, Vec::new()));
    }

    let mut signaled = waiter.signaled.lock();
    if !*signaled {
      match deadline {
        None => waiter.cv.wait(&mut signaled),
        Some(deadline) => {
          if Instant::now() >= deadline
            || waiter.cv.wait_until(&mut signaled, deadline).timed_out()
          {
            return Ok((Vec::new(), Vec::new(), Vec::new()));
          }
        }
      }
    }
    *signaled = false;
  }
}
