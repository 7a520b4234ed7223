use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A set-once result latch bridging reactor-side completion to caller-side
/// bounded waits.
///
/// The reactor task calls [`Completion::set`] exactly once; any number of
/// caller threads can [`Completion::wait`] with the three-way timeout
/// contract (`None` = block, `Some(ZERO)` = never block, `Some(d)` = bounded).
/// Waits use a condition variable keyed by a deadline, never a spin loop.
#[derive(Debug)]
pub(crate) struct Completion<T> {
  state: Mutex<Option<T>>,
  cv: Condvar,
}

pub(crate) type SharedCompletion<T> = Arc<Completion<T>>;

impl<T: Clone> Completion<T> {
  pub fn new() -> SharedCompletion<T> {
    Arc::new(Self {
      state: Mutex::new(None),
      cv: Condvar::new(),
    })
  }

  /// Stores the result and wakes all waiters. The first set wins; later
  /// calls are ignored so a late-resolving task cannot clobber an outcome
  /// someone already observed.
  pub fn set(&self, value: T) {
    let mut guard = self.state.lock();
    if guard.is_none() {
      *guard = Some(value);
      self.cv.notify_all();
    }
  }

  /// Returns the result if already set, without blocking.
  pub fn try_get(&self) -> Option<T> {
    self.state.lock().clone()
  }

  pub fn is_done(&self) -> bool {
    self.state.lock().is_some()
  }

  /// Waits for the result under the socket timeout contract. Returns `None`
  /// on expiry. Spurious wakeups are retried against the deadline and never
  /// surface to callers.
  pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
    let mut guard = self.state.lock();
    match timeout {
      None => {
        while guard.is_none() {
          self.cv.wait(&mut guard);
        }
        guard.clone()
      }
      Some(d) if d.is_zero() => guard.clone(),
      Some(d) => {
        let deadline = Instant::now() + d;
        while guard.is_none() {
          if self.cv.wait_until(&mut guard, deadline).timed_out() {
            return guard.clone();
          }
        }
        guard.clone()
      }
    }
  }
}
