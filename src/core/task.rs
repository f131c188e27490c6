//! Background thread helpers.
//!
//! Every background worker in the store (reconcilers, snapshot rebuilds, the
//! sweeper) runs through [`spawn_guarded`] so a panic is logged with its
//! backtrace instead of silently killing the thread.

use crate::core::error::{Result, StoreError};
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Process-level cancellation flag shared by the store and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f`, converting a panic into a logged `Internal` error.
pub fn run_guarded<T>(name: &str, f: impl FnOnce() -> T) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Ok(v),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            let backtrace = Backtrace::force_capture();
            tracing::error!(task = name, panic = %msg, backtrace = %backtrace, "background task panicked");
            Err(StoreError::Internal(format!("{} panicked: {}", name, msg)))
        }
    }
}

/// Spawns a named thread whose body cannot take the process down with it.
pub fn spawn_guarded<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let task_name = name.to_string();
    thread::Builder::new()
        .name(task_name.clone())
        .spawn(move || {
            let _ = run_guarded(&task_name, f);
        })
        .map_err(|e| StoreError::Internal(format!("failed to spawn {}: {}", name, e)))
}
