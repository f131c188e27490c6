//! Keyed reader/writer locks, one per `(bundle_id, slug)`.
//!
//! Entries are created on first use and never removed; the table grows with
//! the number of distinct slugs ever touched.

use crate::core::error::{Result, StoreError};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, RwLock};

type Key = (String, String);

#[derive(Debug, Default)]
pub struct SlugLock {
    locks: Mutex<FxHashMap<Key, Arc<RwLock<()>>>>,
}

impl SlugLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, bundle_id: &str, slug: &str) -> Result<Arc<RwLock<()>>> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::poisoned("slug lock table"))?;
        Ok(locks
            .entry((bundle_id.to_string(), slug.to_string()))
            .or_default()
            .clone())
    }

    /// Runs `f` holding the shared lock for `(bundle_id, slug)`.
    pub fn with_read<T>(&self, bundle_id: &str, slug: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.entry(bundle_id, slug)?;
        let _guard = lock.read().map_err(|_| StoreError::poisoned("slug lock"))?;
        f()
    }

    /// Runs `f` holding the exclusive lock for `(bundle_id, slug)`.
    pub fn with_write<T>(&self, bundle_id: &str, slug: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.entry(bundle_id, slug)?;
        let _guard = lock.write().map_err(|_| StoreError::poisoned("slug lock"))?;
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
