//! Built-in bundles: immutable assets plus a user-writable enable overlay.
//!
//! The asset tree is read once at construction:
//!
//! - `bundles.json` holds the manifest (`{"bundles": {id: Bundle}}`)
//! - every other `*.json` lives at `<bundle-dir>/<slug>_<version>.json`
//!
//! Each file must name a manifest bundle by its directory and carry the slug
//! and version its file name claims; item ids must be unique across the tree.
//! Readers see a snapshot with overlay flags applied. Flag writes patch the
//! snapshot in place and then ask the single-flight rebuilder for a fresh
//! one.

use crate::core::assets::{AssetTree, MANIFEST_PATH};
use crate::core::error::{Result, StoreError};
use crate::core::model::{AllBundles, Bundle, Item};
use crate::core::names::{self, ITEM_FILE_EXT};
use crate::core::overlay::{FlagKey, FlagRecord, OverlayStore};
use crate::core::rebuilder::AsyncRebuilder;
use crate::core::time::Clock;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Prefix of FTS doc ids that point at built-in items.
pub const BUILTIN_DOC_PREFIX: &str = "builtin/";
pub const OVERLAY_FILE_NAME: &str = "builtin_overlay.json";

/// Overlay key for a built-in bundle's enabled flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinBundleKey(pub String);

impl FlagKey for BuiltinBundleKey {
    const GROUP: &'static str = "bundles";

    fn key_id(&self) -> String {
        self.0.clone()
    }
}

/// Overlay key for a built-in item's enabled flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinItemKey {
    pub bundle_id: String,
    pub item_id: String,
}

impl FlagKey for BuiltinItemKey {
    const GROUP: &'static str = "items";

    fn key_id(&self) -> String {
        format!("{}::{}", self.bundle_id, self.item_id)
    }
}

/// Bundles by id and their items by item id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuiltinData<P> {
    pub bundles: BTreeMap<String, Bundle>,
    pub items: BTreeMap<String, BTreeMap<String, Item<P>>>,
}

impl<P> Default for BuiltinData<P> {
    fn default() -> Self {
        Self {
            bundles: BTreeMap::new(),
            items: BTreeMap::new(),
        }
    }
}

impl<P> BuiltinData<P> {
    fn find_item(&self, bundle_id: &str, slug: &str, version: &str) -> Option<&Item<P>> {
        self.items
            .get(bundle_id)?
            .values()
            .find(|it| it.slug == slug && it.version == version)
    }
}

/// Immutable inputs loaded from the asset tree.
struct BaseData<P> {
    data: BuiltinData<P>,
    /// bundle id -> bundle directory name
    dirs: BTreeMap<String, String>,
    /// bundle directory name -> bundle id
    dir_index: FxHashMap<String, String>,
}

pub struct BuiltinCache<P> {
    base: Arc<BaseData<P>>,
    overlay: Arc<OverlayStore>,
    view: Arc<RwLock<BuiltinData<P>>>,
    rebuilder: AsyncRebuilder,
}

impl<P> std::fmt::Debug for BuiltinCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinCache")
            .field("bundles", &self.base.data.bundles.len())
            .field("overlay", &self.overlay)
            .field("rebuilder", &self.rebuilder)
            .finish()
    }
}

impl<P> BuiltinCache<P>
where
    P: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    pub fn new(
        tree: &dyn AssetTree,
        overlay_path: &Path,
        clock: Arc<dyn Clock>,
        snapshot_max_age: Duration,
    ) -> Result<Self> {
        let base = Arc::new(load_tree::<P>(tree)?);
        let overlay = Arc::new(
            OverlayStore::builder(overlay_path)
                .register::<BuiltinBundleKey>()
                .register::<BuiltinItemKey>()
                .open(clock)?,
        );
        let view = Arc::new(RwLock::new(BuiltinData::default()));
        rebuild_snapshot(&base, &overlay, &view)?;

        let rebuilder = {
            let (base, overlay, view) = (base.clone(), overlay.clone(), view.clone());
            AsyncRebuilder::new("builtin-snapshot", snapshot_max_age, move || {
                rebuild_snapshot(&base, &overlay, &view)
            })
        };
        rebuilder.mark_fresh();

        tracing::info!(
            bundles = base.data.bundles.len(),
            items = base.data.items.values().map(BTreeMap::len).sum::<usize>(),
            "built-in data loaded"
        );
        Ok(Self {
            base,
            overlay,
            view,
            rebuilder,
        })
    }

    fn read_view(&self) -> Result<std::sync::RwLockReadGuard<'_, BuiltinData<P>>> {
        self.view.read().map_err(|_| StoreError::poisoned("built-in view"))
    }

    fn write_view(&self) -> Result<std::sync::RwLockWriteGuard<'_, BuiltinData<P>>> {
        self.view.write().map_err(|_| StoreError::poisoned("built-in view"))
    }

    pub fn is_builtin_bundle(&self, bundle_id: &str) -> bool {
        self.base.data.bundles.contains_key(bundle_id)
    }

    /// Id of the built-in bundle stored under directory `dir`.
    pub fn builtin_bundle_for_dir(&self, dir: &str) -> Option<String> {
        self.base.dir_index.get(dir).cloned()
    }

    pub fn bundle_dir(&self, bundle_id: &str) -> Option<&str> {
        self.base.dirs.get(bundle_id).map(String::as_str)
    }

    /// FTS doc id of a built-in item: `builtin/<bundle-dir>/<file>`.
    pub fn doc_id(&self, bundle_id: &str, slug: &str, version: &str) -> Result<String> {
        let dir = self
            .bundle_dir(bundle_id)
            .ok_or_else(|| StoreError::BuiltInBundleNotFound(bundle_id.to_string()))?;
        Ok(format!(
            "{}{}/{}",
            BUILTIN_DOC_PREFIX,
            dir,
            names::item_file_name(slug, version)?
        ))
    }

    /// Inverse of [`BuiltinCache::doc_id`]: `(bundle_id, slug, version)`.
    pub fn parse_doc_id(&self, doc_id: &str) -> Result<(String, String, String)> {
        let rel = doc_id.strip_prefix(BUILTIN_DOC_PREFIX).ok_or_else(|| {
            StoreError::InvalidFilename(doc_id.to_string(), "not a built-in doc id".to_string())
        })?;
        let (dir, file) = rel.split_once('/').ok_or_else(|| {
            StoreError::InvalidDir(doc_id.to_string(), "missing bundle directory".to_string())
        })?;
        let bundle_id = self
            .builtin_bundle_for_dir(dir)
            .ok_or_else(|| StoreError::InvalidDir(dir.to_string(), "unknown built-in bundle".to_string()))?;
        let (slug, version) = names::parse_item_file_name(file)?;
        Ok((bundle_id, slug, version))
    }

    /// Deep copy of the current overlay-applied snapshot.
    pub fn list_builtin_data(&self) -> Result<BuiltinData<P>> {
        Ok(self.read_view()?.clone())
    }

    pub fn get_builtin_bundle(&self, bundle_id: &str) -> Result<Bundle> {
        self.read_view()?
            .bundles
            .get(bundle_id)
            .cloned()
            .ok_or_else(|| StoreError::BuiltInBundleNotFound(bundle_id.to_string()))
    }

    pub fn get_builtin_item(&self, bundle_id: &str, slug: &str, version: &str) -> Result<Item<P>> {
        self.with_builtin_item(bundle_id, slug, version, |item| Ok(item.clone()))
    }

    /// Runs `f` on the current state of one item with the view read-locked, so
    /// no flag change can land between reading the item and acting on it.
    pub fn with_builtin_item<R>(
        &self,
        bundle_id: &str,
        slug: &str,
        version: &str,
        f: impl FnOnce(&Item<P>) -> Result<R>,
    ) -> Result<R> {
        let view = self.read_view()?;
        if !view.bundles.contains_key(bundle_id) {
            return Err(StoreError::BuiltInBundleNotFound(bundle_id.to_string()));
        }
        let item = view.find_item(bundle_id, slug, version).ok_or_else(|| {
            StoreError::BuiltInItemNotFound(format!("{}/{}@{}", bundle_id, slug, version))
        })?;
        f(item)
    }

    pub fn set_bundle_enabled(&self, bundle_id: &str, enabled: bool) -> Result<Bundle> {
        if !self.is_builtin_bundle(bundle_id) {
            return Err(StoreError::BuiltInBundleNotFound(bundle_id.to_string()));
        }
        let record = self
            .overlay
            .set_flag(&BuiltinBundleKey(bundle_id.to_string()), enabled)?;
        let patched = {
            let mut view = self.write_view()?;
            let bundle = view
                .bundles
                .get_mut(bundle_id)
                .ok_or_else(|| StoreError::BuiltInBundleNotFound(bundle_id.to_string()))?;
            apply_flag(&mut bundle.is_enabled, &mut bundle.modified_at, &record);
            bundle.clone()
        };
        self.rebuilder.trigger();
        tracing::debug!(bundle_id, enabled, "built-in bundle flag set");
        Ok(patched)
    }

    /// Flips the enabled flag of the built-in item `(bundle_id, slug, version)`.
    pub fn set_item_enabled(
        &self,
        bundle_id: &str,
        slug: &str,
        version: &str,
        enabled: bool,
    ) -> Result<Item<P>> {
        let item_id = {
            let base = &self.base.data;
            if !base.bundles.contains_key(bundle_id) {
                return Err(StoreError::BuiltInBundleNotFound(bundle_id.to_string()));
            }
            base.find_item(bundle_id, slug, version)
                .map(|it| it.id.clone())
                .ok_or_else(|| {
                    StoreError::BuiltInItemNotFound(format!("{}/{}@{}", bundle_id, slug, version))
                })?
        };
        let record = self.overlay.set_flag(
            &BuiltinItemKey {
                bundle_id: bundle_id.to_string(),
                item_id: item_id.clone(),
            },
            enabled,
        )?;
        let patched = {
            let mut view = self.write_view()?;
            let item = view
                .items
                .get_mut(bundle_id)
                .and_then(|items| items.get_mut(&item_id))
                .ok_or_else(|| StoreError::BuiltInItemNotFound(item_id.clone()))?;
            apply_flag(&mut item.is_enabled, &mut item.modified_at, &record);
            item.clone()
        };
        self.rebuilder.trigger();
        tracing::debug!(bundle_id, item_id = %item_id, enabled, "built-in item flag set");
        Ok(patched)
    }

    /// Rebuilds the snapshot on the caller's thread.
    pub fn rebuild_now(&self) -> Result<()> {
        self.rebuilder.force()
    }

    pub fn rebuilder(&self) -> &AsyncRebuilder {
        &self.rebuilder
    }
}

fn apply_flag(enabled: &mut bool, modified_at: &mut chrono::DateTime<chrono::Utc>, record: &FlagRecord) {
    *enabled = record.value;
    *modified_at = record.modified_at;
}

fn rebuild_snapshot<P: Clone>(
    base: &BaseData<P>,
    overlay: &OverlayStore,
    view: &RwLock<BuiltinData<P>>,
) -> Result<()> {
    let bundle_flags = overlay.group_flags(BuiltinBundleKey::GROUP)?;
    let item_flags = overlay.group_flags(BuiltinItemKey::GROUP)?;
    let mut next = base.data.clone();
    for (id, bundle) in next.bundles.iter_mut() {
        if let Some(rec) = bundle_flags.get(id) {
            apply_flag(&mut bundle.is_enabled, &mut bundle.modified_at, rec);
        }
    }
    for (bundle_id, items) in next.items.iter_mut() {
        for (item_id, item) in items.iter_mut() {
            let key = BuiltinItemKey {
                bundle_id: bundle_id.clone(),
                item_id: item_id.clone(),
            };
            if let Some(rec) = item_flags.get(&key.key_id()) {
                apply_flag(&mut item.is_enabled, &mut item.modified_at, rec);
            }
        }
    }
    *view.write().map_err(|_| StoreError::poisoned("built-in view"))? = next;
    Ok(())
}

fn load_tree<P: DeserializeOwned + Send>(tree: &dyn AssetTree) -> Result<BaseData<P>> {
    let manifest: AllBundles = serde_json::from_slice(&tree.read(MANIFEST_PATH)?)
        .map_err(|e| StoreError::codec(MANIFEST_PATH, e))?;

    let mut bundles = BTreeMap::new();
    let mut dirs = BTreeMap::new();
    let mut dir_index = FxHashMap::default();
    for (key, mut bundle) in manifest.bundles {
        if key != bundle.id || bundle.id.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "manifest key {:?} does not match bundle id {:?}",
                key, bundle.id
            )));
        }
        let dir = names::bundle_dir_name(&bundle.id, &bundle.slug)?;
        if let Some(other) = dir_index.insert(dir.clone(), bundle.id.clone()) {
            return Err(StoreError::InvalidDir(
                dir,
                format!("shared by built-in bundles {:?} and {:?}", other, bundle.id),
            ));
        }
        bundle.is_built_in = true;
        bundle.soft_deleted_at = None;
        dirs.insert(bundle.id.clone(), dir);
        bundles.insert(bundle.id.clone(), bundle);
    }

    let files: Vec<String> = tree
        .list()?
        .into_iter()
        .filter(|p| p != MANIFEST_PATH && p != OVERLAY_FILE_NAME && p.ends_with(ITEM_FILE_EXT))
        .collect();

    let parsed: Vec<Result<(String, Item<P>)>> = files
        .par_iter()
        .map(|path| load_item::<P>(tree, path, &dir_index, &bundles))
        .collect();

    let mut items: BTreeMap<String, BTreeMap<String, Item<P>>> =
        bundles.keys().map(|id| (id.clone(), BTreeMap::new())).collect();
    let mut seen_ids = FxHashSet::default();
    for entry in parsed {
        let (bundle_id, item) = entry?;
        if !seen_ids.insert(item.id.clone()) {
            return Err(StoreError::InvalidRequest(format!(
                "built-in item id {:?} is not unique",
                item.id
            )));
        }
        items.entry(bundle_id).or_default().insert(item.id.clone(), item);
    }

    Ok(BaseData {
        data: BuiltinData { bundles, items },
        dirs,
        dir_index,
    })
}

fn load_item<P: DeserializeOwned>(
    tree: &dyn AssetTree,
    path: &str,
    dir_index: &FxHashMap<String, String>,
    bundles: &BTreeMap<String, Bundle>,
) -> Result<(String, Item<P>)> {
    let Some((dir, file)) = path.split_once('/') else {
        return Err(StoreError::InvalidDir(
            path.to_string(),
            "item file outside a bundle directory".to_string(),
        ));
    };
    if file.contains('/') {
        return Err(StoreError::InvalidDir(
            path.to_string(),
            "nested directories are not allowed".to_string(),
        ));
    }
    let (_, dir_slug) = names::parse_bundle_dir_name(dir)?;
    let bundle_id = dir_index
        .get(dir)
        .ok_or_else(|| StoreError::InvalidDir(dir.to_string(), "no manifest bundle for directory".to_string()))?;
    let manifest_slug = bundles.get(bundle_id).map(|b| b.slug.as_str());
    if manifest_slug != Some(dir_slug.as_str()) {
        return Err(StoreError::InvalidDir(
            dir.to_string(),
            format!("slug {:?} differs from manifest {:?}", dir_slug, manifest_slug),
        ));
    }

    let (slug, version) = names::parse_item_file_name(file)?;
    let mut item: Item<P> =
        serde_json::from_slice(&tree.read(path)?).map_err(|e| StoreError::codec(path, e))?;
    if item.slug != slug || item.version != version {
        return Err(StoreError::InvalidFilename(
            path.to_string(),
            format!(
                "file names {}@{} but contains {}@{}",
                slug, version, item.slug, item.version
            ),
        ));
    }
    if item.id.is_empty() {
        return Err(StoreError::InvalidRequest(format!("{}: empty item id", path)));
    }
    item.is_built_in = true;
    Ok((bundle_id.clone(), item))
}
