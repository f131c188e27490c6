//! Bundle/item store façade.
//!
//! Composes the building blocks in `core` into one store per item domain:
//!
//! - bundle records in `bundles_meta.json` (user) and the built-in cache
//! - one JSON file per item version under `<bundle-dir>/`
//! - an FTS5 index kept in step by a file listener and two reconcilers
//! - a background sweeper that hard-deletes soft-deleted bundles
//!
//! # Lock order
//!
//! `sweep_mu` → built-in view → slug lock → FTS writer. Meta mutations take
//! `sweep_mu` exclusively; item mutations take it shared, so a bundle cannot
//! be soft-deleted while an item write into it is in flight.

mod bundles;
mod index;
mod items;
mod meta;
mod search;
mod sweeper;

pub use index::ReindexStats;

use crate::core::assets::AssetTree;
use crate::core::builtin::{BuiltinCache, OVERLAY_FILE_NAME};
use crate::core::config::{MIN_SWEEP_INTERVAL, StoreOptions};
use crate::core::dirstore::{DirNameProvider, DirPartitionStore, ListFilesConfig};
use crate::core::error::{Result, StoreError};
use crate::core::fts::FtsEngine;
use crate::core::mapfile::FileListener;
use crate::core::model::Bundle;
use crate::core::names;
use crate::core::slug_lock::SlugLock;
use crate::core::task::CancelToken;
use crate::core::time::Clock;
use crate::plugins::ItemDomain;
use meta::BundleMeta;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

pub const META_FILE_NAME: &str = "bundles_meta.json";
pub const FTS_FILE_NAME: &str = "search.sqlite";

/// A bundle looked up by id, user or built-in.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedBundle {
    pub bundle: Bundle,
    pub dir: String,
}

impl ResolvedBundle {
    pub(crate) fn is_built_in(&self) -> bool {
        self.bundle.is_built_in
    }
}

pub(crate) struct StoreInner<D: ItemDomain> {
    base_dir: PathBuf,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    builtin: BuiltinCache<D::Payload>,
    meta: Arc<BundleMeta>,
    files: DirPartitionStore,
    fts: Option<Arc<FtsEngine>>,
    sweep_mu: RwLock<()>,
    slugs: SlugLock,
    cancel: CancelToken,
}

pub struct BundleStore<D: ItemDomain> {
    inner: Arc<StoreInner<D>>,
    sweeper: Mutex<Option<sweeper::SweeperHandle>>,
    indexers: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: ItemDomain> std::fmt::Debug for BundleStore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStore")
            .field("domain", &D::NAME)
            .field("base_dir", &self.inner.base_dir)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<D: ItemDomain> BundleStore<D> {
    /// Opens a store whose built-ins come from the domain's embedded tree.
    pub fn open(base_dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let tree = D::builtin_tree();
        Self::open_with_tree(base_dir, tree.as_ref(), options)
    }

    pub fn open_with_tree(
        base_dir: impl Into<PathBuf>,
        tree: &dyn AssetTree,
        mut options: StoreOptions,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        options.snapshot_max_age = options.snapshot_max_age.max(Duration::from_nanos(1));
        options.sweep_interval = options.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let clock = options.clock.clone();

        let builtin = BuiltinCache::new(
            tree,
            &base_dir.join(OVERLAY_FILE_NAME),
            clock.clone(),
            options.snapshot_max_age,
        )?;
        let meta = Arc::new(BundleMeta::open(&base_dir.join(META_FILE_NAME))?);

        let mut listeners: Vec<Arc<dyn FileListener>> = Vec::new();
        let fts = if options.fts_enabled {
            let engine = Arc::new(FtsEngine::open(
                base_dir.join(FTS_FILE_NAME),
                D::FTS_TABLE,
                D::fts_columns(),
            )?);
            listeners.push(Arc::new(index::FtsListener::<D>::new(
                engine.clone(),
                base_dir.clone(),
                meta.clone(),
            )));
            Some(engine)
        } else {
            None
        };
        let files = DirPartitionStore::new(&base_dir, Arc::new(DirNameProvider), listeners)?;

        let inner = Arc::new(StoreInner {
            base_dir,
            options,
            clock,
            builtin,
            meta,
            files,
            fts,
            sweep_mu: RwLock::new(()),
            slugs: SlugLock::new(),
            cancel: CancelToken::new(),
        });

        let store = Self {
            sweeper: Mutex::new(Some(sweeper::SweeperHandle::start(inner.clone())?)),
            indexers: Mutex::new(index::spawn_startup_reconcilers(&inner)?),
            inner,
        };
        tracing::info!(
            domain = D::NAME,
            base_dir = %store.inner.base_dir.display(),
            fts = store.inner.fts.is_some(),
            "bundle store opened"
        );
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stops background work and waits for it. Later calls return `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .map_err(|_| StoreError::poisoned("sweeper handle"))?
            .take();
        if let Some(handle) = sweeper {
            handle.stop()?;
        }
        self.join_indexers()?;
        if !self.inner.builtin.rebuilder().wait_idle(Duration::from_secs(30))? {
            tracing::warn!(domain = D::NAME, "built-in snapshot rebuild still running at close");
        }
        tracing::info!(domain = D::NAME, "bundle store closed");
        Ok(())
    }

    fn join_indexers(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = self
            .indexers
            .lock()
            .map_err(|_| StoreError::poisoned("indexer handles"))?
            .drain(..)
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| StoreError::Internal("indexer thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl<D: ItemDomain> Drop for BundleStore<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(domain = D::NAME, error = %e, "failed to close bundle store");
        }
    }
}

impl<D: ItemDomain> StoreInner<D> {
    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        self.cancel.check()
    }

    pub(crate) fn fts(&self) -> Result<&Arc<FtsEngine>> {
        self.fts.as_ref().ok_or(StoreError::FtsDisabled)
    }

    pub(crate) fn meta_write(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.sweep_mu.write().map_err(|_| StoreError::poisoned("sweep"))
    }

    pub(crate) fn meta_read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.sweep_mu.read().map_err(|_| StoreError::poisoned("sweep"))
    }

    /// Resolves a bundle id; soft-deleted user bundles are `BundleDeleting`.
    pub(crate) fn resolve_bundle(&self, bundle_id: &str) -> Result<ResolvedBundle> {
        if bundle_id.is_empty() {
            return Err(StoreError::InvalidRequest("bundle id is required".to_string()));
        }
        if self.builtin.is_builtin_bundle(bundle_id) {
            let bundle = self.builtin.get_builtin_bundle(bundle_id)?;
            let dir = self
                .builtin
                .bundle_dir(bundle_id)
                .ok_or_else(|| StoreError::BuiltInBundleNotFound(bundle_id.to_string()))?
                .to_string();
            return Ok(ResolvedBundle { bundle, dir });
        }
        let bundle = self.user_bundle(bundle_id)?;
        let dir = names::bundle_dir_name(&bundle.id, &bundle.slug)?;
        Ok(ResolvedBundle { bundle, dir })
    }

    pub(crate) fn user_bundle(&self, bundle_id: &str) -> Result<Bundle> {
        let all = self.meta.load()?;
        match all.bundles.get(bundle_id) {
            Some(b) if b.is_soft_deleted() => Err(StoreError::BundleDeleting(bundle_id.to_string())),
            Some(b) => Ok(b.clone()),
            None => Err(StoreError::BundleNotFound(bundle_id.to_string())),
        }
    }

    /// True when the partition directory holds at least one file.
    pub(crate) fn dir_has_files(&self, dir: &str) -> Result<bool> {
        let config = ListFilesConfig {
            page_size: 1,
            filter_partitions: Some(vec![dir.to_string()]),
            ..ListFilesConfig::default()
        };
        let (files, _) = self.files.list_files(&config, None)?;
        Ok(!files.is_empty())
    }
}
