//! Keeps the FTS table in step with items.
//!
//! Doc ids are `<bundle-dir>/<file>` for user items and
//! `builtin/<bundle-dir>/<file>` for built-ins. The compare column `mtime`
//! holds the item file's filesystem mtime (user) or the overlay-applied
//! `modifiedAt` (built-in), both RFC-3339 nano.

use super::meta::{BundleMeta, index_by_dir};
use super::{BundleStore, StoreInner};
use crate::core::builtin::BUILTIN_DOC_PREFIX;
use crate::core::error::{Result, StoreError};
use crate::core::fts::FtsEngine;
use crate::core::fts_sync::{self, DEFAULT_BATCH_SIZE, SyncDecision, SyncStats};
use crate::core::mapfile::{FileEvent, FileListener, FileOp, JsonMap, read_map};
use crate::core::model::Item;
use crate::core::names;
use crate::core::task;
use crate::core::time::{rfc3339_nano, system_time_rfc3339_nano};
use crate::plugins::{COL_MTIME, ItemDomain};
use serde::Serialize;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReindexStats {
    pub user: SyncStats,
    pub builtin: SyncStats,
}

pub(crate) fn is_builtin_doc(id: &str) -> bool {
    id.starts_with(BUILTIN_DOC_PREFIX)
}

fn is_user_doc(id: &str) -> bool {
    !is_builtin_doc(id)
}

/// `base/dir/file` -> `dir/file`; `None` for anything not exactly two levels down.
pub(crate) fn user_doc_id(base_dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base_dir).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [dir, file] => Some(format!("{}/{}", dir, file)),
        _ => None,
    }
}

fn file_mtime(path: &Path) -> Result<String> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| StoreError::io(path, e))?;
    Ok(system_time_rfc3339_nano(modified))
}

fn decode_item<P: serde::de::DeserializeOwned>(data: JsonMap, context: &str) -> Result<Item<P>> {
    serde_json::from_value(serde_json::Value::Object(data)).map_err(|e| StoreError::codec(context, e))
}

/// Mirrors item file writes into the FTS table.
pub(crate) struct FtsListener<D> {
    fts: Arc<FtsEngine>,
    base_dir: PathBuf,
    meta: Arc<BundleMeta>,
    _domain: PhantomData<fn() -> D>,
}

impl<D: ItemDomain> FtsListener<D> {
    pub(crate) fn new(fts: Arc<FtsEngine>, base_dir: PathBuf, meta: Arc<BundleMeta>) -> Self {
        Self {
            fts,
            base_dir,
            meta,
            _domain: PhantomData,
        }
    }
}

impl<D: ItemDomain> FileListener for FtsListener<D> {
    fn on_file_event(&self, event: &FileEvent<'_>) -> Result<()> {
        let Some(doc_id) = user_doc_id(&self.base_dir, event.file) else {
            tracing::warn!(file = %event.file.display(), "file event outside a bundle directory");
            return Ok(());
        };
        match (event.op, event.data) {
            (FileOp::Delete, _) | (_, None) => {
                self.fts.delete(&doc_id)?;
                tracing::debug!(doc_id = %doc_id, "FTS row removed");
            }
            (FileOp::Set | FileOp::Reset, Some(data)) => {
                let (dir, _) = doc_id.split_once('/').unwrap_or((doc_id.as_str(), ""));
                let bundle = self.meta.by_dir()?.remove(dir).ok_or_else(|| {
                    StoreError::InvalidDir(dir.to_string(), "no bundle owns this directory".to_string())
                })?;
                let item: Item<D::Payload> = decode_item(data.clone(), &doc_id)?;
                let mut values = D::fts_values(&bundle.id, &item);
                values.insert(COL_MTIME.to_string(), file_mtime(event.file)?);
                self.fts.upsert(&doc_id, &values)?;
                tracing::debug!(doc_id = %doc_id, "FTS row upserted");
            }
        }
        Ok(())
    }
}

impl<D: ItemDomain> StoreInner<D> {
    /// Reconciles user rows with the item files on disk.
    pub(crate) fn reconcile_user_docs(&self) -> Result<SyncStats> {
        let fts = self.fts()?;
        let bundles = index_by_dir(self.meta.load()?);
        let base_dir = self.base_dir.clone();
        let stats = fts_sync::sync_dir_to_fts(
            fts,
            &self.base_dir,
            COL_MTIME,
            DEFAULT_BATCH_SIZE,
            &is_user_doc,
            &self.cancel,
            |path, get_prev| {
                let skip = || SyncDecision {
                    skip: true,
                    ..SyncDecision::default()
                };
                let Some(doc_id) = user_doc_id(&base_dir, path) else {
                    return Ok(skip());
                };
                let Some((dir, file)) = doc_id.split_once('/') else {
                    return Ok(skip());
                };
                let Ok((slug, version)) = names::parse_item_file_name(file) else {
                    return Ok(skip());
                };
                let Some(bundle) = bundles.get(dir) else {
                    tracing::warn!(file = %path.display(), "item file in a directory no bundle owns");
                    return Ok(skip());
                };
                let mtime = file_mtime(path)?;
                if get_prev(&doc_id).as_deref() == Some(mtime.as_str()) {
                    return Ok(SyncDecision {
                        id: doc_id,
                        cmp_out: mtime,
                        unchanged: true,
                        ..SyncDecision::default()
                    });
                }
                let item: Item<D::Payload> = decode_item(read_map(path)?, &doc_id)?;
                if item.slug != slug || item.version != version {
                    return Err(StoreError::InvalidFilename(
                        doc_id,
                        format!("contents name {}@{}", item.slug, item.version),
                    ));
                }
                Ok(SyncDecision {
                    values: D::fts_values(&bundle.id, &item),
                    id: doc_id,
                    cmp_out: mtime,
                    unchanged: false,
                    skip: false,
                })
            },
        )?;
        tracing::info!(domain = D::NAME, stats = ?stats, "user FTS reconcile finished");
        Ok(stats)
    }

    /// Reconciles `builtin/` rows with the current built-in snapshot.
    pub(crate) fn reconcile_builtin_docs(&self) -> Result<SyncStats> {
        let fts = self.fts()?;
        let data = self.builtin.list_builtin_data()?;
        let decisions = data.items.iter().flat_map(|(bundle_id, items)| {
            items.values().map(move |item| -> Result<SyncDecision> {
                Ok(SyncDecision {
                    id: self.builtin.doc_id(bundle_id, &item.slug, &item.version)?,
                    cmp_out: rfc3339_nano(item.modified_at),
                    values: D::fts_values(bundle_id, item),
                    unchanged: false,
                    skip: false,
                })
            })
        });
        let stats = fts_sync::sync_iter_to_fts(
            fts,
            COL_MTIME,
            DEFAULT_BATCH_SIZE,
            &is_builtin_doc,
            &self.cancel,
            decisions,
        )?;
        tracing::info!(domain = D::NAME, stats = ?stats, "built-in FTS reconcile finished");
        Ok(stats)
    }

    /// Refreshes the FTS row of one built-in item after a flag change.
    ///
    /// The row is written from the item's current state while the built-in
    /// view is read-locked, so racing patches leave the row matching the
    /// last flag written.
    pub(crate) fn index_builtin_item(&self, bundle_id: &str, slug: &str, version: &str) -> Result<()> {
        let Some(fts) = self.fts.as_ref() else {
            return Ok(());
        };
        self.builtin.with_builtin_item(bundle_id, slug, version, |item| {
            let mut values = D::fts_values(bundle_id, item);
            values.insert(COL_MTIME.to_string(), rfc3339_nano(item.modified_at));
            fts.upsert(&self.builtin.doc_id(bundle_id, &item.slug, &item.version)?, &values)
        })
    }
}

/// Starts both reconcilers in the background when FTS is on.
pub(crate) fn spawn_startup_reconcilers<D: ItemDomain>(
    inner: &Arc<StoreInner<D>>,
) -> Result<Vec<JoinHandle<()>>> {
    if inner.fts.is_none() {
        return Ok(Vec::new());
    }
    let user = {
        let inner = inner.clone();
        task::spawn_guarded(&format!("reindex-user-{}", D::NAME), move || {
            if let Err(e) = inner.reconcile_user_docs() {
                log_reconcile_error(D::NAME, "user", &e);
            }
        })?
    };
    let builtin = {
        let inner = inner.clone();
        task::spawn_guarded(&format!("reindex-builtin-{}", D::NAME), move || {
            if let Err(e) = inner.reconcile_builtin_docs() {
                log_reconcile_error(D::NAME, "built-in", &e);
            }
        })?
    };
    Ok(vec![user, builtin])
}

fn log_reconcile_error(domain: &str, namespace: &str, e: &StoreError) {
    if matches!(e, StoreError::Closed) {
        tracing::debug!(domain, namespace, "FTS reconcile cancelled by close");
    } else {
        tracing::error!(domain, namespace, error = %e, "FTS reconcile failed");
    }
}

impl<D: ItemDomain> BundleStore<D> {
    /// Blocks until the startup reconcilers have finished.
    pub fn wait_for_index(&self) -> Result<()> {
        self.join_indexers()
    }

    /// Runs both reconcilers on the caller's thread.
    pub fn reindex(&self) -> Result<ReindexStats> {
        let s = &*self.inner;
        s.check_open()?;
        s.fts()?;
        self.join_indexers()?;
        Ok(ReindexStats {
            user: s.reconcile_user_docs()?,
            builtin: s.reconcile_builtin_docs()?,
        })
    }

    /// Number of rows in the FTS table.
    pub fn index_stats(&self) -> Result<usize> {
        self.inner.check_open()?;
        self.inner.fts()?.count()
    }
}
