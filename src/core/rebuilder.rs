//! Single-flight rebuilder for stale snapshots.
//!
//! At most one worker runs at a time. Triggers that arrive while a worker is
//! running, or while the last success is younger than `max_age`, are dropped:
//! the work function always reads current inputs, so nothing is lost.

use crate::core::error::{Result, StoreError};
use crate::core::task;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type WorkFn = dyn Fn() -> Result<()> + Send + Sync;

struct Inner {
    name: String,
    work: Box<WorkFn>,
    max_age: Duration,
    epoch: Instant,
    /// Nanos since `epoch` of the last success; 0 means never.
    last_success_nanos: AtomicU64,
    running: AtomicBool,
    /// Completed-run counter, paired with `done` for waiters.
    finished: Mutex<u64>,
    done: Condvar,
}

#[derive(Clone)]
pub struct AsyncRebuilder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AsyncRebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRebuilder")
            .field("name", &self.inner.name)
            .field("max_age", &self.inner.max_age)
            .field("running", &self.is_running())
            .finish()
    }
}

impl AsyncRebuilder {
    pub fn new<F>(name: &str, max_age: Duration, work: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                work: Box::new(work),
                max_age: max_age.max(Duration::from_nanos(1)),
                epoch: Instant::now(),
                last_success_nanos: AtomicU64::new(0),
                running: AtomicBool::new(false),
                finished: Mutex::new(0),
                done: Condvar::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_fresh(&self) -> bool {
        self.inner.is_fresh()
    }

    /// Records a successful build that happened outside the rebuilder.
    pub fn mark_fresh(&self) {
        self.inner.mark_fresh();
    }

    /// Starts a background rebuild if the snapshot is stale and none is running.
    /// Returns whether a worker was started.
    pub fn trigger(&self) -> bool {
        if self.inner.is_fresh() {
            return false;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let inner = self.inner.clone();
        let spawned = task::spawn_guarded(&format!("rebuild-{}", self.inner.name), move || {
            let guard = RunningGuard(inner.clone());
            match (inner.work)() {
                Ok(()) => inner.mark_fresh(),
                Err(e) => tracing::error!(rebuilder = %inner.name, error = %e, "snapshot rebuild failed"),
            }
            drop(guard);
        });
        if let Err(e) = spawned {
            tracing::error!(rebuilder = %self.inner.name, error = %e, "could not start rebuild worker");
            self.inner.finish_run();
            return false;
        }
        true
    }

    /// Runs the work synchronously on the caller's thread.
    pub fn force(&self) -> Result<()> {
        (self.inner.work)()?;
        self.inner.mark_fresh();
        Ok(())
    }

    /// Blocks until no worker is running or `timeout` passes; true when idle.
    pub fn wait_idle(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut finished = self
            .inner
            .finished
            .lock()
            .map_err(|_| StoreError::poisoned("rebuilder"))?;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .inner
                .done
                .wait_timeout(finished, deadline - now)
                .map_err(|_| StoreError::poisoned("rebuilder"))?;
            finished = guard;
        }
        Ok(true)
    }
}

impl Inner {
    fn now_nanos(&self) -> u64 {
        // Never 0, so a recorded success is distinguishable from "never".
        (self.epoch.elapsed().as_nanos() as u64).max(1)
    }

    fn is_fresh(&self) -> bool {
        let last = self.last_success_nanos.load(Ordering::SeqCst);
        last != 0 && self.now_nanos().saturating_sub(last) < self.max_age.as_nanos() as u64
    }

    fn mark_fresh(&self) {
        self.last_success_nanos.store(self.now_nanos(), Ordering::SeqCst);
    }

    fn finish_run(&self) {
        let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        self.running.store(false, Ordering::SeqCst);
        *finished += 1;
        self.done.notify_all();
    }
}

/// Clears `running` even when the work function panics.
struct RunningGuard(Arc<Inner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.finish_run();
    }
}
