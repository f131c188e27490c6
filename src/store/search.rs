use super::BundleStore;
use super::index::is_builtin_doc;
use super::items::list_entry;
use crate::core::dirstore::FileKey;
use crate::core::error::{Result, StoreError};
use crate::core::fts::FtsHit;
use crate::core::model::{Bundle, ItemListEntry, SearchHit, SearchItemsRequest, SearchItemsResponse};
use crate::core::names;
use crate::core::token;
use crate::plugins::ItemDomain;
use rustc_hash::FxHashMap;

impl<D: ItemDomain> BundleStore<D> {
    /// Ranked full-text search over built-in and user items.
    ///
    /// Hits whose item vanished, whose bundle is being deleted, or which are
    /// disabled (unless requested) are dropped. The next token records the
    /// engine offset just past the last consumed hit, so nothing repeats.
    pub fn search_items(&self, req: SearchItemsRequest) -> Result<SearchItemsResponse> {
        let s = &*self.inner;
        s.check_open()?;
        let fts = s.fts()?;
        let page_size = token::clamp_page_size(req.page_size);
        let mut offset = fts.search_token_offset(&req.query, req.page_token.as_deref())?;
        let user_bundles = s.meta.by_dir()?;

        let mut hits = Vec::with_capacity(page_size);
        let mut more = false;
        'fetch: loop {
            s.check_open()?;
            let (batch, has_more) = fts.search_at(&req.query, offset, page_size * 2)?;
            for hit in batch {
                if hits.len() >= page_size {
                    more = true;
                    break 'fetch;
                }
                offset += 1;
                let Some((entry, bundle_enabled)) = self.hydrate_hit(&hit, &user_bundles)? else {
                    continue;
                };
                if !req.include_disabled && !(bundle_enabled && entry.is_enabled) {
                    continue;
                }
                hits.push(SearchHit {
                    entry,
                    score: hit.score,
                });
            }
            if !has_more {
                break;
            }
            if hits.len() >= page_size {
                more = true;
                break;
            }
        }

        let next_page_token = if more {
            Some(fts.search_token(&req.query, offset)?)
        } else {
            None
        };
        Ok(SearchItemsResponse {
            hits,
            next_page_token,
        })
    }

    /// Turns an FTS hit into a list entry plus its bundle's enabled flag;
    /// `None` when the item is gone.
    fn hydrate_hit(
        &self,
        hit: &FtsHit,
        user_bundles: &FxHashMap<String, Bundle>,
    ) -> Result<Option<(ItemListEntry, bool)>> {
        let s = &*self.inner;
        let looked_up = if is_builtin_doc(&hit.doc_id) {
            s.builtin.parse_doc_id(&hit.doc_id).and_then(|(bundle_id, slug, version)| {
                let bundle = s.builtin.get_builtin_bundle(&bundle_id)?;
                let item = s.builtin.get_builtin_item(&bundle_id, &slug, &version)?;
                Ok((list_entry(&bundle, &item), bundle.is_enabled))
            })
        } else {
            let Some((dir, file)) = hit.doc_id.split_once('/') else {
                return Ok(None);
            };
            let Some(bundle) = user_bundles.get(dir).filter(|b| !b.is_soft_deleted()) else {
                return Ok(None);
            };
            names::parse_item_file_name(file).and_then(|(slug, version)| {
                let item = s.read_user_item(&FileKey::new(dir, file), &slug, &version)?;
                Ok((list_entry(bundle, &item), bundle.is_enabled))
            })
        };
        match looked_up {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if is_stale(&e) => {
                tracing::debug!(doc_id = %hit.doc_id, error = %e, "dropping stale search hit");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Index rows can outlive their files until the next listener event or
/// reconcile; those lookups are skipped rather than failing the page.
fn is_stale(e: &StoreError) -> bool {
    e.is_not_found_io()
        || matches!(
            e,
            StoreError::BuiltInBundleNotFound(_)
                | StoreError::BuiltInItemNotFound(_)
                | StoreError::InvalidDir(..)
                | StoreError::InvalidFilename(..)
                | StoreError::InvalidSlug(..)
                | StoreError::InvalidVersion(..)
                | StoreError::Codec { .. }
        )
}
