use super::BundleStore;
use crate::core::error::{Result, StoreError};
use crate::core::model::{Bundle, ListBundlesRequest, ListBundlesResponse, PutBundleRequest};
use crate::core::names;
use crate::core::token;
use crate::plugins::ItemDomain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListBundlesToken {
    page_size: usize,
    include_disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bundle_ids: Vec<String>,
    after_modified_at: DateTime<Utc>,
    after_id: String,
}

/// Newest first; ties by id ascending.
fn listing_order(a: &Bundle, b: &Bundle) -> Ordering {
    b.modified_at.cmp(&a.modified_at).then_with(|| a.id.cmp(&b.id))
}

impl<D: ItemDomain> BundleStore<D> {
    /// Creates or replaces a user bundle.
    pub fn put_bundle(&self, bundle_id: &str, body: PutBundleRequest) -> Result<Bundle> {
        let s = &*self.inner;
        s.check_open()?;
        if bundle_id.trim().is_empty() {
            return Err(StoreError::InvalidRequest("bundle id is required".to_string()));
        }
        if body.display_name.trim().is_empty() {
            return Err(StoreError::InvalidRequest("displayName is required".to_string()));
        }
        names::validate_slug(&body.slug)?;
        if s.builtin.is_builtin_bundle(bundle_id) {
            return Err(StoreError::BuiltInReadOnly(bundle_id.to_string()));
        }

        let _guard = s.meta_write()?;
        let mut all = s.meta.load()?;
        if let Some(other) = all
            .bundles
            .values()
            .find(|b| b.id != bundle_id && b.slug == body.slug && !b.is_soft_deleted())
        {
            return Err(StoreError::Conflict(format!(
                "slug {:?} is used by bundle {:?}",
                body.slug, other.id
            )));
        }

        // Sanitized ids can collide, so the directory must be unique too,
        // including against records still waiting for the sweeper.
        let dir = names::bundle_dir_name(bundle_id, &body.slug)?;
        if let Some(other) = all.bundles.values().find(|b| {
            b.id != bundle_id && names::bundle_dir_name(&b.id, &b.slug).is_ok_and(|d| d == dir)
        }) {
            return Err(StoreError::Conflict(format!(
                "directory {:?} is held by bundle {:?}",
                dir, other.id
            )));
        }

        let now = s.now();
        let created_at = match all.bundles.get(bundle_id) {
            Some(existing) if existing.is_soft_deleted() => {
                return Err(StoreError::BundleDeleting(bundle_id.to_string()));
            }
            Some(existing) if existing.slug != body.slug => {
                let old_dir = names::bundle_dir_name(&existing.id, &existing.slug)?;
                if s.dir_has_files(&old_dir)? {
                    return Err(StoreError::InvalidRequest(format!(
                        "cannot change the slug of bundle {:?} while it holds items",
                        bundle_id
                    )));
                }
                if let Err(e) = s.files.remove_partition(&old_dir) {
                    tracing::warn!(bundle_id, error = %e, "could not remove old bundle directory");
                }
                existing.created_at
            }
            Some(existing) => existing.created_at,
            None => now,
        };

        let bundle = Bundle {
            id: bundle_id.to_string(),
            slug: body.slug,
            display_name: body.display_name,
            description: body.description,
            is_enabled: body.is_enabled,
            is_built_in: false,
            created_at,
            modified_at: now,
            soft_deleted_at: None,
        };
        all.bundles.insert(bundle.id.clone(), bundle.clone());
        s.meta.save(&all)?;
        tracing::debug!(bundle_id, slug = %bundle.slug, "bundle saved");
        Ok(bundle)
    }

    /// Enables or disables a bundle; built-ins go through the overlay.
    pub fn patch_bundle(&self, bundle_id: &str, enabled: bool) -> Result<Bundle> {
        let s = &*self.inner;
        s.check_open()?;
        if bundle_id.is_empty() {
            return Err(StoreError::InvalidRequest("bundle id is required".to_string()));
        }
        if s.builtin.is_builtin_bundle(bundle_id) {
            return s.builtin.set_bundle_enabled(bundle_id, enabled);
        }

        let _guard = s.meta_write()?;
        let mut all = s.meta.load()?;
        let bundle = all
            .bundles
            .get_mut(bundle_id)
            .ok_or_else(|| StoreError::BundleNotFound(bundle_id.to_string()))?;
        if bundle.is_soft_deleted() {
            return Err(StoreError::BundleDeleting(bundle_id.to_string()));
        }
        bundle.is_enabled = enabled;
        bundle.modified_at = s.now();
        let patched = bundle.clone();
        s.meta.save(&all)?;
        tracing::debug!(bundle_id, enabled, "bundle patched");
        Ok(patched)
    }

    pub fn get_bundle(&self, bundle_id: &str) -> Result<Bundle> {
        self.inner.check_open()?;
        Ok(self.inner.resolve_bundle(bundle_id)?.bundle)
    }

    /// Soft-deletes an empty user bundle and wakes the sweeper.
    pub fn delete_bundle(&self, bundle_id: &str) -> Result<()> {
        let s = &*self.inner;
        s.check_open()?;
        if bundle_id.is_empty() {
            return Err(StoreError::InvalidRequest("bundle id is required".to_string()));
        }
        if s.builtin.is_builtin_bundle(bundle_id) {
            return Err(StoreError::BuiltInReadOnly(bundle_id.to_string()));
        }
        {
            let _guard = s.meta_write()?;
            let mut all = s.meta.load()?;
            let bundle = all
                .bundles
                .get_mut(bundle_id)
                .ok_or_else(|| StoreError::BundleNotFound(bundle_id.to_string()))?;
            if bundle.is_soft_deleted() {
                return Err(StoreError::BundleDeleting(bundle_id.to_string()));
            }
            let dir = names::bundle_dir_name(&bundle.id, &bundle.slug)?;
            if s.dir_has_files(&dir)? {
                return Err(StoreError::BundleNotEmpty(bundle_id.to_string()));
            }
            let now = s.now();
            bundle.is_enabled = false;
            bundle.soft_deleted_at = Some(now);
            bundle.modified_at = now;
            s.meta.save(&all)?;
        }
        tracing::info!(bundle_id, "bundle soft-deleted");
        self.kick_sweeper();
        Ok(())
    }

    /// Built-in and live user bundles, newest first.
    pub fn list_bundles(&self, req: ListBundlesRequest) -> Result<ListBundlesResponse> {
        let s = &*self.inner;
        s.check_open()?;
        let (page_size, include_disabled, bundle_ids, after) = match token::non_empty(req.page_token.as_deref()) {
            Some(t) => {
                let tok: ListBundlesToken = token::decode(t)?;
                (
                    token::clamp_page_size(tok.page_size),
                    tok.include_disabled,
                    tok.bundle_ids,
                    Some((tok.after_modified_at, tok.after_id)),
                )
            }
            None => (
                token::clamp_page_size(req.page_size),
                req.include_disabled,
                req.bundle_ids,
                None,
            ),
        };

        let mut all: Vec<Bundle> = s.builtin.list_builtin_data()?.bundles.into_values().collect();
        all.extend(
            s.meta
                .load()?
                .bundles
                .into_values()
                .filter(|b| !b.is_soft_deleted()),
        );
        all.retain(|b| {
            (include_disabled || b.is_enabled)
                && (bundle_ids.is_empty() || bundle_ids.contains(&b.id))
        });
        all.sort_by(listing_order);

        let start = match &after {
            Some((after_m, after_id)) => all
                .iter()
                .position(|b| b.modified_at < *after_m || (b.modified_at == *after_m && b.id > *after_id))
                .unwrap_or(all.len()),
            None => 0,
        };
        let page: Vec<Bundle> = all.iter().skip(start).take(page_size).cloned().collect();
        let next_page_token = match page.last() {
            Some(last) if start + page.len() < all.len() => Some(token::encode(&ListBundlesToken {
                page_size,
                include_disabled,
                bundle_ids,
                after_modified_at: last.modified_at,
                after_id: last.id.clone(),
            })?),
            _ => None,
        };
        Ok(ListBundlesResponse {
            bundles: page,
            next_page_token,
        })
    }
}
