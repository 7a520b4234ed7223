//! The shared reactor: a fixed-size tokio multi-thread runtime that drives
//! every channel's non-blocking I/O, plus the primitives that bridge its
//! futures to blocking callers.

pub(crate) mod latch;
pub(crate) mod queue;

pub(crate) use latch::{Completion, SharedCompletion};
pub(crate) use queue::{PopError, WaitQueue};

use crate::error::SockError;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Worker threads in the shared pool when no explicit configuration is given.
pub const DEFAULT_WORKER_THREADS: usize = 10;

/// Configuration for the process-wide reactor. Only honored by the first
/// initialization ([`init`] or init-on-first-use).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
  /// Fixed size of the I/O worker-thread pool.
  pub worker_threads: usize,
}

impl Default for ReactorConfig {
  fn default() -> Self {
    Self {
      worker_threads: DEFAULT_WORKER_THREADS,
    }
  }
}

#[derive(Debug)]
pub(crate) struct Reactor {
  handle: Handle,
  // Kept so shutdown() can consume the runtime with a bounded grace period.
  runtime: Mutex<Option<Runtime>>,
}

static REACTOR: OnceCell<Reactor> = OnceCell::new();
static SHUT_DOWN: AtomicBool = AtomicBool::new(false);
static NEXT_SOCK_ID: AtomicUsize = AtomicUsize::new(1);

/// Generates the next unique socket handle id.
pub(crate) fn next_sock_id() -> u64 {
  NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed) as u64
}

fn build_reactor(config: &ReactorConfig) -> Result<Reactor, SockError> {
  let counter = AtomicUsize::new(0);
  let runtime = Builder::new_multi_thread()
    .worker_threads(config.worker_threads.max(1))
    .thread_name_fn(move || {
      let n = counter.fetch_add(1, Ordering::Relaxed);
      format!("resock-io-{}", n)
    })
    .enable_io()
    .enable_time()
    .build()
    .map_err(|e| {
      tracing::error!(error = %e, "Failed to build reactor runtime");
      SockError::ResourceExhausted("cannot allocate reactor worker threads")
    })?;
  let handle = runtime.handle().clone();
  tracing::debug!(workers = config.worker_threads, "Reactor runtime started");
  Ok(Reactor {
    handle,
    runtime: Mutex::new(Some(runtime)),
  })
}

/// Initializes the shared reactor with an explicit configuration. Fails with
/// `InvalidState` if the reactor is already running (init-on-first-use may
/// have beaten the caller to it).
pub fn init(config: ReactorConfig) -> Result<(), SockError> {
  let mut fresh = false;
  REACTOR.get_or_try_init(|| {
    fresh = true;
    build_reactor(&config)
  })?;
  if fresh {
    Ok(())
  } else {
    Err(SockError::InvalidState("reactor already initialized"))
  }
}

/// The shared reactor, started on first use. Fails `ResourceExhausted` once
/// [`shutdown`] has run.
pub(crate) fn reactor() -> Result<&'static Reactor, SockError> {
  if SHUT_DOWN.load(Ordering::Acquire) {
    return Err(SockError::ResourceExhausted("reactor has been shut down"));
  }
  REACTOR.get_or_try_init(|| build_reactor(&ReactorConfig::default()))
}

/// Gracefully stops the shared reactor, waiting up to `grace` for in-flight
/// I/O tasks. Intended to be invoked by the host's shutdown sequence; after
/// this every operation needing the reactor fails `ResourceExhausted`.
pub fn shutdown(grace: Duration) {
  SHUT_DOWN.store(true, Ordering::Release);
  if let Some(reactor) = REACTOR.get() {
    if let Some(runtime) = reactor.runtime.lock().take() {
      tracing::info!(?grace, "Shutting down reactor");
      runtime.shutdown_timeout(grace);
    }
  }
}

impl Reactor {
  /// Spawns a task onto the worker pool.
  pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.handle.spawn(fut)
  }

  /// Enters the runtime context on the current thread, needed for
  /// `from_std` conversions of sockets created synchronously.
  pub fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
    self.handle.enter()
  }

  /// Runs a one-shot future on the reactor and waits on the caller thread
  /// under the socket timeout contract. The wait is a channel receive
  /// (condition variable under the hood), never a spin.
  ///
  /// On expiry the spawned task is aborted so no reactor-side interest
  /// leaks, then the result slot is drained once in case the task won the
  /// race; only a genuinely absent result surfaces as `Timeout`.
  pub fn run_with_timeout<F, T>(&self, timeout: Option<Duration>, fut: F) -> Result<T, SockError>
  where
    F: Future<Output = Result<T, SockError>> + Send + 'static,
    T: Send + 'static,
  {
    let (tx, rx) = mpsc::sync_channel::<Result<T, SockError>>(1);
    let task = self.spawn(async move {
      let _ = tx.send(fut.await);
    });

    match timeout {
      None => rx
        .recv()
        .unwrap_or_else(|_| Err(SockError::ResourceExhausted("reactor stopped during wait"))),
      Some(d) => match rx.recv_timeout(if d.is_zero() { Duration::from_micros(1) } else { d }) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
          task.abort();
          match rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(SockError::Timeout),
          }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
          Err(SockError::ResourceExhausted("reactor stopped during wait"))
        }
      },
    }
  }
}
