use rusqlite;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid slug {0:?}: {1}")]
    InvalidSlug(String, String),
    #[error("Invalid version {0:?}: {1}")]
    InvalidVersion(String, String),
    #[error("Invalid filename {0:?}: {1}")]
    InvalidFilename(String, String),
    #[error("Invalid bundle directory {0:?}: {1}")]
    InvalidDir(String, String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bundle not found: {0}")]
    BundleNotFound(String),
    #[error("Item not found: {0}")]
    ItemNotFound(String),
    #[error("Built-in bundle not found: {0}")]
    BuiltInBundleNotFound(String),
    #[error("Built-in item not found: {0}")]
    BuiltInItemNotFound(String),
    #[error("Bundle is disabled: {0}")]
    BundleDisabled(String),
    #[error("Bundle is being deleted: {0}")]
    BundleDeleting(String),
    #[error("Bundle is not empty: {0}")]
    BundleNotEmpty(String),
    #[error("Built-in data is read-only: {0}")]
    BuiltInReadOnly(String),
    #[error("Full-text search is disabled for this store")]
    FtsDisabled,
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error ({context}): {source}")]
    Codec {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Store is closed")]
    Closed,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Stable machine-readable code for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::InvalidRequest(_) => "invalid_request",
            StoreError::InvalidSlug(..) => "invalid_slug",
            StoreError::InvalidVersion(..) => "invalid_version",
            StoreError::InvalidFilename(..) => "invalid_filename",
            StoreError::InvalidDir(..) => "invalid_dir",
            StoreError::Conflict(_) => "conflict",
            StoreError::BundleNotFound(_) => "bundle_not_found",
            StoreError::ItemNotFound(_) => "item_not_found",
            StoreError::BuiltInBundleNotFound(_) => "builtin_bundle_not_found",
            StoreError::BuiltInItemNotFound(_) => "builtin_item_not_found",
            StoreError::BundleDisabled(_) => "bundle_disabled",
            StoreError::BundleDeleting(_) => "bundle_deleting",
            StoreError::BundleNotEmpty(_) => "bundle_not_empty",
            StoreError::BuiltInReadOnly(_) => "builtin_read_only",
            StoreError::FtsDisabled => "fts_disabled",
            StoreError::Io { .. } => "io",
            StoreError::Codec { .. } => "codec",
            StoreError::Sqlite(_) => "sqlite",
            StoreError::Config(_) => "config",
            StoreError::Closed => "closed",
            StoreError::Internal(_) => "internal",
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(context: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Codec {
            context: context.into(),
            source,
        }
    }

    pub fn poisoned(what: &str) -> Self {
        StoreError::Internal(format!("{} lock poisoned", what))
    }

    /// True for I/O errors caused by a missing file or directory.
    pub fn is_not_found_io(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
