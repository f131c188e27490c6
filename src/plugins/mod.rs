//! Item domains stored by [`crate::store::BundleStore`].
//!
//! The store core is payload-agnostic. A domain supplies the payload type that
//! is flattened into each item file, the FTS table layout and the per-item
//! search text, and the validation `PutItem` runs before writing.
//!
//! - `prompts`: prompt templates made of role-tagged message blocks
//! - `tools`: tool specifications with argument schemas and an HTTP or native impl

pub mod prompts;
pub mod tools;

use crate::core::assets::AssetTree;
use crate::core::error::Result;
use crate::core::fts::{FtsColumn, FtsValues};
use crate::core::model::Item;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

pub use prompts::Prompts;
pub use tools::Tools;

/// Indexed columns every domain table carries.
pub const COL_SLUG: &str = "slug";
pub const COL_DISPLAY_NAME: &str = "displayName";
pub const COL_DESC: &str = "desc";
pub const COL_TAGS: &str = "tags";
pub const COL_BODY: &str = "body_text";
/// Unindexed columns every domain table carries.
pub const COL_ENABLED: &str = "enabled";
pub const COL_BUNDLE_ID: &str = "bundleID";
pub const COL_MTIME: &str = "mtime";

pub trait ItemDomain: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Short name used in logs and by the CLI.
    const NAME: &'static str;
    const FTS_TABLE: &'static str;

    /// Domain columns indexed after the shared ones.
    fn extra_columns() -> Vec<FtsColumn>;

    /// Free text indexed into `body_text`.
    fn body_text(payload: &Self::Payload) -> String;

    /// Values for [`ItemDomain::extra_columns`].
    fn extra_values(payload: &Self::Payload) -> FtsValues;

    /// Checks an assembled item before it is written.
    fn validate(item: &Item<Self::Payload>) -> Result<()>;

    /// Built-in bundles shipped in the binary.
    fn builtin_tree() -> Arc<dyn AssetTree>;

    fn fts_columns() -> Vec<FtsColumn> {
        let mut cols = vec![
            FtsColumn::indexed(COL_SLUG, 4.0),
            FtsColumn::indexed(COL_DISPLAY_NAME, 3.0),
            FtsColumn::indexed(COL_DESC, 2.0),
            FtsColumn::indexed(COL_TAGS, 2.0),
            FtsColumn::indexed(COL_BODY, 1.0),
        ];
        cols.extend(Self::extra_columns());
        cols.push(FtsColumn::unindexed(COL_ENABLED));
        cols.push(FtsColumn::unindexed(COL_BUNDLE_ID));
        cols.push(FtsColumn::unindexed(COL_MTIME));
        cols
    }

    /// All FTS values of an item except `mtime`.
    fn fts_values(bundle_id: &str, item: &Item<Self::Payload>) -> FtsValues {
        let mut values = Self::extra_values(&item.payload);
        values.insert(COL_SLUG.to_string(), item.slug.clone());
        values.insert(COL_DISPLAY_NAME.to_string(), item.display_name.clone());
        values.insert(COL_DESC.to_string(), item.description.clone().unwrap_or_default());
        values.insert(COL_TAGS.to_string(), item.tags.join(" "));
        values.insert(COL_BODY.to_string(), Self::body_text(&item.payload));
        values.insert(COL_ENABLED.to_string(), item.is_enabled.to_string());
        values.insert(COL_BUNDLE_ID.to_string(), bundle_id.to_string());
        values
    }
}

/// Tags share the slug alphabet so they survive the FTS tokenizer intact.
pub(crate) fn validate_tags(tags: &[String]) -> Result<()> {
    for tag in tags {
        crate::core::names::validate_slug(tag).map_err(|_| {
            crate::core::error::StoreError::InvalidRequest(format!("invalid tag {:?}", tag))
        })?;
    }
    Ok(())
}
