use crate::core::error::Result;
use crate::core::mapfile::{MapFileOptions, MapFileStore};
use crate::core::model::{AllBundles, Bundle};
use crate::core::names;
use rustc_hash::FxHashMap;
use std::path::Path;

/// User bundle records in `bundles_meta.json`.
///
/// Writers must hold the store's `sweep_mu` exclusively.
#[derive(Debug)]
pub(crate) struct BundleMeta {
    file: MapFileStore,
}

impl BundleMeta {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: MapFileStore::open_typed(path, &AllBundles::default(), MapFileOptions::default())?,
        })
    }

    pub(crate) fn load(&self) -> Result<AllBundles> {
        self.file.get_as(false)
    }

    pub(crate) fn save(&self, all: &AllBundles) -> Result<()> {
        self.file.set_as(all)
    }

    /// Every user bundle keyed by its partition directory name.
    pub(crate) fn by_dir(&self) -> Result<FxHashMap<String, Bundle>> {
        Ok(index_by_dir(self.load()?))
    }
}

/// Maps partition directory names to bundles. A live record wins a
/// directory over a soft-deleted one that happens to share it.
pub(crate) fn index_by_dir(all: AllBundles) -> FxHashMap<String, Bundle> {
    let mut out: FxHashMap<String, Bundle> = FxHashMap::default();
    for b in all.bundles.into_values() {
        let dir = match names::bundle_dir_name(&b.id, &b.slug) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(bundle_id = %b.id, error = %e, "bundle record has an unusable slug");
                continue;
            }
        };
        match out.get(&dir) {
            Some(held) if !held.is_soft_deleted() && b.is_soft_deleted() => {
                tracing::warn!(dir = %dir, kept = %held.id, dropped = %b.id, "bundles share a directory");
            }
            Some(held) => {
                tracing::warn!(dir = %dir, kept = %b.id, dropped = %held.id, "bundles share a directory");
                out.insert(dir, b);
            }
            None => {
                out.insert(dir, b);
            }
        }
    }
    out
}
