use super::{BundleStore, StoreInner};
use crate::core::dirstore::{FileKey, ListFilesConfig, SortOrder};
use crate::core::error::{Result, StoreError};
use crate::core::mapfile::to_json_map;
use crate::core::model::{Bundle, Item, ItemListEntry, ListItemsRequest, ListItemsResponse, PutItemRequest};
use crate::core::names;
use crate::core::token;
use crate::plugins::ItemDomain;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resume point of a `list_items` scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListItemsToken {
    page_size: usize,
    include_disabled: bool,
    all_versions: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bundle_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    builtins_done: bool,
    /// Directory-store token of the batch holding the next entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch_token: Option<String>,
    /// Entries of that batch already consumed.
    #[serde(default)]
    skip: usize,
    /// Last emitted `(bundle_dir, slug)`, for version dedupe across pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_slug: Option<(String, String)>,
}

fn check_item_names(bundle_id: &str, slug: &str, version: &str) -> Result<()> {
    if bundle_id.is_empty() {
        return Err(StoreError::InvalidRequest("bundle id is required".to_string()));
    }
    names::validate_slug(slug)?;
    names::validate_version(version)
}

fn not_found(bundle_id: &str, slug: &str, version: &str) -> StoreError {
    StoreError::ItemNotFound(format!("{}/{}@{}", bundle_id, slug, version))
}

pub(super) fn list_entry<P>(bundle: &Bundle, item: &Item<P>) -> ItemListEntry {
    ItemListEntry {
        bundle_id: bundle.id.clone(),
        bundle_slug: bundle.slug.clone(),
        slug: item.slug.clone(),
        version: item.version.clone(),
        display_name: item.display_name.clone(),
        is_enabled: item.is_enabled,
        is_built_in: item.is_built_in,
        tags: item.tags.clone(),
        modified_at: item.modified_at,
    }
}

impl<D: ItemDomain> StoreInner<D> {
    fn item_key(&self, dir: &str, slug: &str, version: &str) -> Result<FileKey> {
        Ok(FileKey::new(dir, names::item_file_name(slug, version)?))
    }

    /// Reads a user item file and checks it names the requested version.
    pub(crate) fn read_user_item(&self, key: &FileKey, slug: &str, version: &str) -> Result<Item<D::Payload>> {
        let data = self.files.get_file_data(key)?;
        let context = format!("{}/{}", key.partition_attr, key.file_name);
        let item: Item<D::Payload> = serde_json::from_value(serde_json::Value::Object(data))
            .map_err(|e| StoreError::codec(&context, e))?;
        if item.slug != slug || item.version != version {
            return Err(StoreError::InvalidFilename(
                context,
                format!("contents name {}@{}", item.slug, item.version),
            ));
        }
        Ok(item)
    }
}

impl<D: ItemDomain> BundleStore<D> {
    /// Writes a new immutable item version into a user bundle.
    pub fn put_item(
        &self,
        bundle_id: &str,
        slug: &str,
        version: &str,
        body: PutItemRequest<D::Payload>,
    ) -> Result<Item<D::Payload>> {
        let s = &*self.inner;
        s.check_open()?;
        check_item_names(bundle_id, slug, version)?;
        if body.display_name.trim().is_empty() {
            return Err(StoreError::InvalidRequest("displayName is required".to_string()));
        }

        let _sweep = s.meta_read()?;
        let resolved = s.resolve_bundle(bundle_id)?;
        if resolved.is_built_in() {
            return Err(StoreError::BuiltInReadOnly(bundle_id.to_string()));
        }
        if !resolved.bundle.is_enabled {
            return Err(StoreError::BundleDisabled(bundle_id.to_string()));
        }
        let key = s.item_key(&resolved.dir, slug, version)?;

        s.slugs.with_write(bundle_id, slug, || {
            if s.files.file_exists(&key)? {
                return Err(StoreError::Conflict(format!(
                    "{}/{}@{} already exists",
                    bundle_id, slug, version
                )));
            }
            let now = s.now();
            let item = Item {
                id: Uuid::now_v7().to_string(),
                slug: slug.to_string(),
                version: version.to_string(),
                display_name: body.display_name,
                description: body.description,
                tags: body.tags,
                is_enabled: body.is_enabled,
                is_built_in: false,
                created_at: now,
                modified_at: now,
                payload: body.payload,
            };
            D::validate(&item)?;
            s.files.set_file_data(&key, to_json_map(&item)?)?;
            tracing::debug!(domain = D::NAME, bundle_id, item_id = %item.id, slug, version, "item written");
            Ok(item)
        })
    }

    /// Enables or disables one item version; built-ins go through the overlay.
    pub fn patch_item(&self, bundle_id: &str, slug: &str, version: &str, enabled: bool) -> Result<Item<D::Payload>> {
        let s = &*self.inner;
        s.check_open()?;
        check_item_names(bundle_id, slug, version)?;

        // Built-ins take no slug lock; the view lock orders flag writes and
        // their FTS refresh.
        if s.builtin.is_builtin_bundle(bundle_id) {
            let item = s.builtin.set_item_enabled(bundle_id, slug, version, enabled)?;
            if let Err(e) = s.index_builtin_item(bundle_id, slug, version) {
                tracing::error!(bundle_id, item_id = %item.id, error = %e, "could not reindex built-in item");
            }
            return Ok(item);
        }

        let _sweep = s.meta_read()?;
        let resolved = s.resolve_bundle(bundle_id)?;
        let key = s.item_key(&resolved.dir, slug, version)?;
        s.slugs.with_write(bundle_id, slug, || {
            if !s.files.file_exists(&key)? {
                return Err(not_found(bundle_id, slug, version));
            }
            let mut item = s.read_user_item(&key, slug, version)?;
            item.is_enabled = enabled;
            item.modified_at = s.now();
            s.files.set_file_data(&key, to_json_map(&item)?)?;
            tracing::debug!(domain = D::NAME, bundle_id, item_id = %item.id, enabled, "item patched");
            Ok(item)
        })
    }

    pub fn delete_item(&self, bundle_id: &str, slug: &str, version: &str) -> Result<()> {
        let s = &*self.inner;
        s.check_open()?;
        check_item_names(bundle_id, slug, version)?;
        if s.builtin.is_builtin_bundle(bundle_id) {
            return Err(StoreError::BuiltInReadOnly(bundle_id.to_string()));
        }

        let _sweep = s.meta_read()?;
        let resolved = s.resolve_bundle(bundle_id)?;
        let key = s.item_key(&resolved.dir, slug, version)?;
        s.slugs.with_write(bundle_id, slug, || {
            if !s.files.file_exists(&key)? {
                return Err(not_found(bundle_id, slug, version));
            }
            s.files.delete_file(&key)?;
            tracing::debug!(domain = D::NAME, bundle_id, slug, version, "item deleted");
            Ok(())
        })
    }

    pub fn get_item(&self, bundle_id: &str, slug: &str, version: &str) -> Result<Item<D::Payload>> {
        let s = &*self.inner;
        s.check_open()?;
        check_item_names(bundle_id, slug, version)?;
        if s.builtin.is_builtin_bundle(bundle_id) {
            return s.builtin.get_builtin_item(bundle_id, slug, version);
        }

        let resolved = s.resolve_bundle(bundle_id)?;
        let key = s.item_key(&resolved.dir, slug, version)?;
        s.slugs.with_read(bundle_id, slug, || {
            if !s.files.file_exists(&key)? {
                return Err(not_found(bundle_id, slug, version));
            }
            s.read_user_item(&key, slug, version)
        })
    }

    /// Lists built-in items first, then user items in descending file order.
    pub fn list_items(&self, req: ListItemsRequest) -> Result<ListItemsResponse> {
        let s = &*self.inner;
        s.check_open()?;
        let mut cursor = match token::non_empty(req.page_token.as_deref()) {
            Some(t) => token::decode::<ListItemsToken>(t)?,
            None => ListItemsToken {
                page_size: token::clamp_page_size(req.page_size),
                include_disabled: req.include_disabled,
                all_versions: req.all_versions,
                bundle_ids: req.bundle_ids,
                tags: req.tags,
                builtins_done: false,
                batch_token: None,
                skip: 0,
                last_slug: None,
            },
        };
        let page_size = token::clamp_page_size(cursor.page_size);
        let mut items = Vec::new();

        if !cursor.builtins_done {
            items.extend(self.builtin_entries(&cursor)?);
            cursor.builtins_done = true;
        }

        let user_bundles: FxHashMap<String, Bundle> = s
            .meta
            .by_dir()?
            .into_iter()
            .filter(|(_, b)| !b.is_soft_deleted())
            .filter(|(_, b)| cursor.bundle_ids.is_empty() || cursor.bundle_ids.contains(&b.id))
            .collect();
        let filter_partitions = if cursor.bundle_ids.is_empty() {
            None
        } else {
            let mut dirs: Vec<String> = user_bundles.keys().cloned().collect();
            dirs.sort_by(|a, b| b.cmp(a));
            Some(dirs)
        };
        let config = ListFilesConfig {
            sort_order: SortOrder::Desc,
            page_size,
            filter_partitions,
            filename_prefix: None,
        };

        loop {
            let (files, next) = s.files.list_files(&config, cursor.batch_token.as_deref())?;
            for (i, path) in files.iter().enumerate().skip(cursor.skip) {
                let Some((bundle, item)) = self.user_entry(path, &user_bundles)? else {
                    continue;
                };
                if !cursor.include_disabled && !(bundle.is_enabled && item.is_enabled) {
                    continue;
                }
                if !item.has_all_tags(&cursor.tags) {
                    continue;
                }
                let dir = bundle_dir_of(path);
                if !cursor.all_versions
                    && cursor
                        .last_slug
                        .as_ref()
                        .is_some_and(|(d, slug)| d == dir && *slug == item.slug)
                {
                    continue;
                }
                if items.len() >= page_size {
                    cursor.skip = i;
                    return Ok(ListItemsResponse {
                        items,
                        next_page_token: Some(token::encode(&cursor)?),
                    });
                }
                cursor.last_slug = Some((dir.to_string(), item.slug.clone()));
                items.push(list_entry(bundle, &item));
            }
            cursor.skip = 0;
            match next {
                Some(t) => cursor.batch_token = Some(t),
                None => {
                    return Ok(ListItemsResponse {
                        items,
                        next_page_token: None,
                    });
                }
            }
        }
    }

    /// Qualifying built-in items ordered by bundle id, then item id.
    fn builtin_entries(&self, cursor: &ListItemsToken) -> Result<Vec<ItemListEntry>> {
        let data = self.inner.builtin.list_builtin_data()?;
        let mut picked: Vec<(&Bundle, &Item<D::Payload>)> = Vec::new();
        for (bundle_id, items) in &data.items {
            let Some(bundle) = data.bundles.get(bundle_id) else {
                continue;
            };
            if !cursor.bundle_ids.is_empty() && !cursor.bundle_ids.contains(bundle_id) {
                continue;
            }
            for item in items.values() {
                if !cursor.include_disabled && !(bundle.is_enabled && item.is_enabled) {
                    continue;
                }
                if item.has_all_tags(&cursor.tags) {
                    picked.push((bundle, item));
                }
            }
        }
        if !cursor.all_versions {
            let mut newest: FxHashMap<(&str, &str), &str> = FxHashMap::default();
            for (bundle, item) in &picked {
                let v = newest
                    .entry((bundle.id.as_str(), item.slug.as_str()))
                    .or_insert(item.version.as_str());
                if item.version.as_str() > *v {
                    *v = item.version.as_str();
                }
            }
            picked.retain(|(bundle, item)| {
                newest.get(&(bundle.id.as_str(), item.slug.as_str())) == Some(&item.version.as_str())
            });
        }
        Ok(picked.into_iter().map(|(b, it)| list_entry(b, it)).collect())
    }

    /// Loads the item behind a `dir/file` listing path; `None` when it no
    /// longer exists or belongs to no listed bundle.
    fn user_entry<'a>(
        &self,
        path: &str,
        bundles: &'a FxHashMap<String, Bundle>,
    ) -> Result<Option<(&'a Bundle, Item<D::Payload>)>> {
        let Some((dir, file)) = path.split_once('/') else {
            return Ok(None);
        };
        let Some(bundle) = bundles.get(dir) else {
            return Ok(None);
        };
        let Ok((slug, version)) = names::parse_item_file_name(file) else {
            tracing::warn!(file = %path, "skipping file with an unparseable name");
            return Ok(None);
        };
        match self.inner.read_user_item(&FileKey::new(dir, file), &slug, &version) {
            Ok(item) => Ok(Some((bundle, item))),
            Err(e) if e.is_not_found_io() => Ok(None),
            Err(e @ (StoreError::Codec { .. } | StoreError::InvalidFilename(..))) => {
                tracing::warn!(file = %path, error = %e, "skipping unreadable item file");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn bundle_dir_of(path: &str) -> &str {
    path.split_once('/').map_or(path, |(dir, _)| dir)
}
