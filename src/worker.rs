//! Background execution context.
//!
//! Reconciliation and store writes are long-running and must stay off the
//! host's interactive thread. Every such call takes a [`Background`] token, and
//! the only place tokens are minted is the worker thread owned by
//! [`BackgroundWorker`]. Work reaches that thread through a crossbeam queue:
//!
//! - `execute`: fire-and-forget closure
//! - `run_blocking`: closure whose result is handed back to the caller
//! - `invalidate`: debounced reconciliation of a [`Reconcile`] target; repeated
//!   requests for the same target inside the debounce window collapse into one run

use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Token proving the holder runs on the background worker.
///
/// Not constructible outside this crate; borrow it from a worker closure.
pub struct Background {
    _private: (),
}

impl Background {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Something the worker can reconcile after an invalidation.
pub trait Reconcile: Send + Sync {
    fn reconcile(&self, bg: &Background);

    /// Name used in logs.
    fn debug_name(&self) -> &str;
}

type Task = Box<dyn FnOnce(&Background) + Send>;

enum Job {
    Run(Task),
    Invalidate { key: u64, target: Weak<dyn Reconcile> },
    Flush(Sender<()>),
    Shutdown,
}

struct Pending {
    due: Instant,
    target: Weak<dyn Reconcile>,
}

/// Single background thread serializing reconciliation, ingestion and EOSE work.
pub struct BackgroundWorker {
    sender: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl BackgroundWorker {
    /// Spawn the worker thread. `debounce` is the invalidation bundling window.
    pub fn spawn(name: &str, debounce: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name(format!("{name}-sync"))
            .spawn(move || run_loop(receiver, debounce))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Whether the calling thread is the worker itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue a closure without waiting for it.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Background) + Send + 'static,
    {
        self.sender
            .send(Job::Run(Box::new(f)))
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Run a closure on the worker and wait for its result.
    ///
    /// Called from the worker itself, the closure runs inline.
    pub fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Background) -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(f(&Background::new()));
        }

        let (tx, rx) = bounded(1);
        self.execute(move |bg| {
            let _ = tx.send(f(bg));
        })?;
        rx.recv().map_err(|_| SyncError::WorkerStopped)
    }

    /// Schedule a debounced reconciliation of `target`, keyed by `key`.
    pub fn invalidate(&self, key: u64, target: Weak<dyn Reconcile>) -> Result<()> {
        self.sender
            .send(Job::Invalidate { key, target })
            .map_err(|_| SyncError::WorkerStopped)
    }

    /// Run every pending invalidation now and wait until the queue ahead is drained.
    pub fn flush(&self) -> Result<()> {
        if self.is_current() {
            return Ok(());
        }
        let (tx, rx) = bounded(1);
        self.sender
            .send(Job::Flush(tx))
            .map_err(|_| SyncError::WorkerStopped)?;
        rx.recv().map_err(|_| SyncError::WorkerStopped)
    }

    /// Stop the worker after it drains queued jobs. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Job::Shutdown);
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Background worker panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(receiver: Receiver<Job>, debounce: Duration) {
    let bg = Background::new();
    let mut pending: HashMap<u64, Pending> = HashMap::new();

    loop {
        let next_due = pending.values().map(|p| p.due).min();
        let job = match next_due {
            Some(due) => {
                let wait = due.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(job) => Some(job),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(job) => Some(job),
                Err(_) => break,
            },
        };

        match job {
            Some(Job::Run(task)) => task(&bg),
            Some(Job::Invalidate { key, target }) => {
                // An already-pending request absorbs this one.
                pending.entry(key).or_insert_with(|| Pending {
                    due: Instant::now() + debounce,
                    target,
                });
            }
            Some(Job::Flush(ack)) => {
                run_due(&mut pending, &bg, None);
                let _ = ack.send(());
            }
            Some(Job::Shutdown) => break,
            None => {}
        }

        run_due(&mut pending, &bg, Some(Instant::now()));
    }

    debug!(dropped = pending.len(), "Background worker stopped");
}

/// Run pending reconciliations due by `now` (all of them when `now` is `None`).
fn run_due(pending: &mut HashMap<u64, Pending>, bg: &Background, now: Option<Instant>) {
    let due: Vec<u64> = pending
        .iter()
        .filter(|(_, p)| now.map_or(true, |now| p.due <= now))
        .map(|(key, _)| *key)
        .collect();

    for key in due {
        if let Some(p) = pending.remove(&key) {
            match p.target.upgrade() {
                Some(target) => {
                    trace!(name = target.debug_name(), "Running bundled reconciliation");
                    target.reconcile(bg);
                }
                None => trace!(key, "Invalidation target already dropped"),
            }
        }
    }
}
