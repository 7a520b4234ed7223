use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Outcome of a bounded pop that found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopError {
  /// Non-blocking pop with an empty queue.
  Empty,
  /// Bounded wait expired.
  TimedOut,
}

/// FIFO queue bridging reactor producers and blocking consumers.
///
/// Producers are reactor tasks (synchronous push, short critical section);
/// consumers are caller threads using the three-way timeout contract. With a
/// capacity, async producers park on [`WaitQueue::space`] until a consumer
/// makes room — the queue itself never blocks a reactor thread.
#[derive(Debug)]
pub(crate) struct WaitQueue<T> {
  inner: Mutex<VecDeque<T>>,
  cv: Condvar,
  capacity: Option<usize>,
  space: Notify,
}

impl<T> WaitQueue<T> {
  pub fn unbounded() -> Self {
    Self {
      inner: Mutex::new(VecDeque::new()),
      cv: Condvar::new(),
      capacity: None,
      space: Notify::new(),
    }
  }

  pub fn bounded(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(VecDeque::new()),
      cv: Condvar::new(),
      capacity: Some(capacity.max(1)),
      space: Notify::new(),
    }
  }

  /// Pushes an item and wakes one waiting consumer.
  pub fn push(&self, item: T) {
    let mut q = self.inner.lock();
    q.push_back(item);
    drop(q);
    self.cv.notify_one();
  }

  pub fn has_room(&self) -> bool {
    match self.capacity {
      None => true,
      Some(cap) => self.inner.lock().len() < cap,
    }
  }

  /// Parks an async producer until [`WaitQueue::has_room`]. Re-checked in a
  /// loop because a notification may race another producer.
  pub async fn wait_for_room(&self) {
    while !self.has_room() {
      self.space.notified().await;
    }
  }

  pub fn try_pop(&self) -> Option<T> {
    let item = self.inner.lock().pop_front();
    if item.is_some() {
      self.space.notify_one();
    }
    item
  }

  /// Pops under the socket timeout contract: `None` blocks indefinitely,
  /// `Some(ZERO)` never blocks, `Some(d)` waits up to the deadline.
  /// Spurious wakeups retry against the deadline.
  pub fn pop(&self, timeout: Option<Duration>) -> Result<T, PopError> {
    let mut q = self.inner.lock();
    match timeout {
      Some(d) if d.is_zero() => match q.pop_front() {
        Some(item) => {
          self.space.notify_one();
          Ok(item)
        }
        None => Err(PopError::Empty),
      },
      None => loop {
        if let Some(item) = q.pop_front() {
          self.space.notify_one();
          return Ok(item);
        }
        self.cv.wait(&mut q);
      },
      Some(d) => {
        let deadline = Instant::now() + d;
        loop {
          if let Some(item) = q.pop_front() {
            self.space.notify_one();
            return Ok(item);
          }
          if self.cv.wait_until(&mut q, deadline).timed_out() {
            return match q.pop_front() {
              Some(item) => {
                self.space.notify_one();
                Ok(item)
              }
              None => Err(PopError::TimedOut),
            };
          }
        }
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().is_empty()
  }

  /// Removes and returns everything queued, used by close() to release
  /// unconsumed buffers / unaccepted children.
  pub fn drain(&self) -> Vec<T> {
    let drained: Vec<T> = self.inner.lock().drain(..).collect();
    if !drained.is_empty() {
      self.space.notify_one();
    }
    drained
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn zero_timeout_pop_is_nonblocking() {
    let q: WaitQueue<u8> = WaitQueue::unbounded();
    assert_eq!(q.pop(Some(Duration::ZERO)), Err(PopError::Empty));
    q.push(1);
    assert_eq!(q.pop(Some(Duration::ZERO)), Ok(1));
  }

  #[test]
  fn bounded_pop_times_out_within_epsilon() {
    let q: WaitQueue<u8> = WaitQueue::unbounded();
    let started = Instant::now();
    assert_eq!(q.pop(Some(Duration::from_millis(80))), Err(PopError::TimedOut));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < Duration::from_millis(500));
  }

  #[test]
  fn push_wakes_blocked_popper_fifo() {
    let q: Arc<WaitQueue<u8>> = Arc::new(WaitQueue::unbounded());
    let q2 = q.clone();
    let t = thread::spawn(move || q2.pop(None));
    thread::sleep(Duration::from_millis(20));
    q.push(1);
    q.push(2);
    assert_eq!(t.join().unwrap(), Ok(1));
    assert_eq!(q.try_pop(), Some(2));
  }

  #[test]
  fn capacity_gates_room() {
    let q: WaitQueue<u8> = WaitQueue::bounded(1);
    assert!(q.has_room());
    q.push(1);
    assert!(!q.has_room());
    q.try_pop();
    assert!(q.has_room());
  }
}
