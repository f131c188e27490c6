//! Hard-deletes soft-deleted bundles once their grace period has passed.
//!
//! One thread per store wakes every `sweep_interval` or when kicked through a
//! one-slot channel. A panicking sweep is logged and the loop carries on.

use super::{BundleStore, StoreInner};
use crate::core::error::{Result, StoreError};
use crate::core::names;
use crate::core::task;
use crate::core::time::older_than;
use crate::plugins::ItemDomain;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct SweeperHandle {
    kick: SyncSender<()>,
    thread: JoinHandle<()>,
}

impl SweeperHandle {
    pub(crate) fn start<D: ItemDomain>(inner: Arc<StoreInner<D>>) -> Result<Self> {
        let (kick, rx) = mpsc::sync_channel::<()>(1);
        let interval = inner.options.sweep_interval;
        let thread = task::spawn_guarded(&format!("sweeper-{}", D::NAME), move || {
            sweep_loop(D::NAME, &rx, interval, || inner.cancel.is_cancelled(), || inner.sweep_once());
        })?;
        Ok(Self { kick, thread })
    }

    fn kick(&self) {
        match self.kick.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::warn!("sweeper is not running");
            }
        }
    }

    /// Disconnects the channel and joins the thread.
    pub(crate) fn stop(self) -> Result<()> {
        drop(self.kick);
        self.thread
            .join()
            .map_err(|_| StoreError::Internal("sweeper thread panicked".to_string()))
    }
}

/// Runs `sweep` on every kick or timeout until the channel disconnects, the
/// store is cancelled, or a sweep reports `Closed`. Failed and panicking
/// sweeps are logged and the loop carries on.
fn sweep_loop(
    domain: &str,
    rx: &Receiver<()>,
    interval: Duration,
    cancelled: impl Fn() -> bool,
    sweep: impl Fn() -> Result<Vec<String>>,
) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if cancelled() {
            break;
        }
        match task::run_guarded("sweep", &sweep) {
            Ok(Ok(removed)) if !removed.is_empty() => {
                tracing::info!(domain, removed = ?removed, "sweeper removed bundles");
            }
            Ok(Ok(_)) => {}
            Ok(Err(StoreError::Closed)) => break,
            Ok(Err(e)) => tracing::error!(domain, error = %e, "sweep failed"),
            // Already logged with its backtrace.
            Err(_) => {}
        }
    }
    tracing::debug!(domain, "sweeper stopped");
}

impl<D: ItemDomain> StoreInner<D> {
    /// Removes every soft-deleted bundle past its grace period that is still
    /// empty, returning the removed ids.
    pub(crate) fn sweep_once(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut dirs = Vec::new();
        let mut removed = Vec::new();
        {
            let _guard = self.meta_write()?;
            let mut all = self.meta.load()?;
            let now = self.now();
            let live_dirs: FxHashSet<String> = all
                .bundles
                .values()
                .filter(|b| !b.is_soft_deleted())
                .filter_map(|b| names::bundle_dir_name(&b.id, &b.slug).ok())
                .collect();
            for bundle in all.bundles.values() {
                self.check_open()?;
                let Some(deleted_at) = bundle.soft_deleted_at else {
                    continue;
                };
                if !older_than(deleted_at, now, self.options.soft_delete_grace) {
                    continue;
                }
                let dir = match names::bundle_dir_name(&bundle.id, &bundle.slug) {
                    Ok(dir) => dir,
                    Err(e) => {
                        tracing::warn!(bundle_id = %bundle.id, error = %e, "sweeping bundle with unusable slug");
                        removed.push(bundle.id.clone());
                        continue;
                    }
                };
                if live_dirs.contains(&dir) {
                    tracing::warn!(bundle_id = %bundle.id, dir = %dir, "dropping record whose directory a live bundle holds");
                    removed.push(bundle.id.clone());
                    continue;
                }
                match self.dir_has_files(&dir) {
                    Ok(false) => {
                        removed.push(bundle.id.clone());
                        dirs.push(dir);
                    }
                    Ok(true) => {
                        tracing::warn!(bundle_id = %bundle.id, "soft-deleted bundle still holds files; keeping it");
                    }
                    Err(e) => {
                        tracing::error!(bundle_id = %bundle.id, error = %e, "could not inspect bundle directory");
                    }
                }
            }
            if removed.is_empty() {
                return Ok(removed);
            }
            for id in &removed {
                all.bundles.remove(id);
            }
            self.meta.save(&all)?;
            // Still under the exclusive guard: a bundle recreated with the same
            // directory cannot receive items before the old one is gone.
            for dir in dirs {
                if let Err(e) = self.files.remove_partition(&dir) {
                    tracing::warn!(dir = %dir, error = %e, "could not remove swept bundle directory");
                }
            }
        }
        Ok(removed)
    }
}

impl<D: ItemDomain> BundleStore<D> {
    pub(crate) fn kick_sweeper(&self) {
        match self.sweeper.lock() {
            Ok(guard) => {
                if let Some(handle) = guard.as_ref() {
                    handle.kick();
                }
            }
            Err(_) => tracing::error!("sweeper handle lock poisoned"),
        }
    }

    /// Runs one sweep on the caller's thread and returns the removed ids.
    pub fn sweep_now(&self) -> Result<Vec<String>> {
        let removed = self.inner.sweep_once()?;
        if !removed.is_empty() {
            tracing::info!(domain = D::NAME, removed = ?removed, "sweep removed bundles");
        }
        Ok(removed)
    }
}
