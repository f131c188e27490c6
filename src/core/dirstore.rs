//! Multi-file JSON store partitioned into subdirectories.
//!
//! Each file is a [`MapFileStore`]; a [`PartitionProvider`] decides which
//! subdirectory a key lands in. Listing walks partitions in order and returns
//! opaque tokens that resume exactly where the previous page stopped.

use crate::core::error::{Result, StoreError};
use crate::core::mapfile::{FileListener, JsonMap, MapFileOptions, MapFileStore};
use crate::core::token;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub file_name: String,
    pub partition_attr: String,
}

impl FileKey {
    pub fn new(partition_attr: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            partition_attr: partition_attr.into(),
        }
    }
}

pub trait PartitionProvider: Send + Sync {
    /// Directory name, relative to the base, for a partition attribute.
    fn partition_dir(&self, partition_attr: &str) -> Result<String>;

    /// Up to `limit` partition directories strictly after `after` in `order`.
    fn list_partitions(
        &self,
        base_dir: &Path,
        order: SortOrder,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;
}

/// Partition attribute is the directory name itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirNameProvider;

impl PartitionProvider for DirNameProvider {
    fn partition_dir(&self, partition_attr: &str) -> Result<String> {
        if partition_attr.is_empty()
            || partition_attr.starts_with('.')
            || partition_attr.contains(['/', '\\'])
        {
            return Err(StoreError::InvalidDir(
                partition_attr.to_string(),
                "not a plain directory name".to_string(),
            ));
        }
        Ok(partition_attr.to_string())
    }

    fn list_partitions(
        &self,
        base_dir: &Path,
        order: SortOrder,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(StoreError::io(base_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(base_dir, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && !name.starts_with('.') {
                dirs.push(name);
            }
        }
        sort_names(&mut dirs, order);
        Ok(dirs
            .into_iter()
            .filter(|d| match (after, order) {
                (None, _) => true,
                (Some(a), SortOrder::Asc) => d.as_str() > a,
                (Some(a), SortOrder::Desc) => d.as_str() < a,
            })
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilesConfig {
    pub sort_order: SortOrder,
    pub page_size: usize,
    /// Restrict the walk to these partition attributes, in this order.
    pub filter_partitions: Option<Vec<String>>,
    pub filename_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
enum PartitionCursor {
    /// Position in `filter_partitions`.
    Index(usize),
    /// Current directory name from the provider.
    Name(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListFilesToken {
    sort_order: SortOrder,
    page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter_partitions: Option<Vec<String>>,
    file_index: usize,
    partition: PartitionCursor,
}

pub struct DirPartitionStore {
    base_dir: PathBuf,
    provider: Arc<dyn PartitionProvider>,
    listeners: Vec<Arc<dyn FileListener>>,
    files: Mutex<FxHashMap<PathBuf, Arc<MapFileStore>>>,
}

impl DirPartitionStore {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        provider: Arc<dyn PartitionProvider>,
        listeners: Vec<Arc<dyn FileListener>>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| StoreError::io(&base_dir, e))?;
        Ok(Self {
            base_dir,
            provider,
            listeners,
            files: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, key: &FileKey) -> Result<PathBuf> {
        let dir = self.provider.partition_dir(&key.partition_attr)?;
        if key.file_name.is_empty() || key.file_name.contains(['/', '\\']) {
            return Err(StoreError::InvalidFilename(
                key.file_name.clone(),
                "not a plain file name".to_string(),
            ));
        }
        Ok(self.base_dir.join(dir).join(&key.file_name))
    }

    fn store_for(&self, key: &FileKey) -> Result<Arc<MapFileStore>> {
        let path = self.path_for(key)?;
        let mut files = self.files.lock().map_err(|_| StoreError::poisoned("partition store"))?;
        if let Some(store) = files.get(&path) {
            return Ok(store.clone());
        }
        let store = Arc::new(MapFileStore::open(
            &path,
            JsonMap::new(),
            MapFileOptions {
                auto_flush: true,
                create_if_missing: false,
                listeners: self.listeners.clone(),
            },
        )?);
        files.insert(path, store.clone());
        Ok(store)
    }

    pub fn file_exists(&self, key: &FileKey) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    /// Creates or truncates the file for `key`.
    pub fn set_file_data(&self, key: &FileKey, data: JsonMap) -> Result<()> {
        self.store_for(key)?.set_all(data)
    }

    pub fn get_file_data(&self, key: &FileKey) -> Result<JsonMap> {
        self.store_for(key)?.get_all(false)
    }

    pub fn delete_file(&self, key: &FileKey) -> Result<()> {
        let store = self.store_for(key)?;
        store.delete_file()?;
        self.files
            .lock()
            .map_err(|_| StoreError::poisoned("partition store"))?
            .remove(store.path());
        Ok(())
    }

    /// Best-effort `rm -rf` of a whole partition directory.
    pub fn remove_partition(&self, partition_attr: &str) -> Result<()> {
        let dir = self.base_dir.join(self.provider.partition_dir(partition_attr)?);
        self.files
            .lock()
            .map_err(|_| StoreError::poisoned("partition store"))?
            .retain(|path, _| !path.starts_with(&dir));
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// Returns `partition_dir/file_name` paths and the token for the next page.
    pub fn list_files(
        &self,
        config: &ListFilesConfig,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut cursor = match token::non_empty(page_token) {
            Some(t) => token::decode::<ListFilesToken>(t)?,
            None => {
                let partition = match &config.filter_partitions {
                    Some(_) => PartitionCursor::Index(0),
                    None => match self.next_partition(config.sort_order, None)? {
                        Some(first) => PartitionCursor::Name(first),
                        None => return Ok((Vec::new(), None)),
                    },
                };
                ListFilesToken {
                    sort_order: config.sort_order,
                    page_size: config.page_size.max(1),
                    filename_prefix: config.filename_prefix.clone(),
                    filter_partitions: config.filter_partitions.clone(),
                    file_index: 0,
                    partition,
                }
            }
        };

        let page_size = cursor.page_size.max(1);
        let mut out = Vec::new();
        while out.len() < page_size {
            let Some(dir) = self.current_dir(&cursor)? else {
                return Ok((out, None));
            };
            let files =
                list_dir_files(&self.base_dir.join(&dir), cursor.filename_prefix.as_deref(), cursor.sort_order)?;
            let remaining = page_size - out.len();
            for name in files.iter().skip(cursor.file_index).take(remaining) {
                out.push(format!("{}/{}", dir, name));
                cursor.file_index += 1;
            }
            if cursor.file_index < files.len() {
                return Ok((out, Some(token::encode(&cursor)?)));
            }
            if !self.advance_partition(&mut cursor, &dir)? {
                return Ok((out, None));
            }
        }
        Ok((out, Some(token::encode(&cursor)?)))
    }

    fn current_dir(&self, cursor: &ListFilesToken) -> Result<Option<String>> {
        match &cursor.partition {
            PartitionCursor::Index(i) => match cursor.filter_partitions.as_ref().and_then(|f| f.get(*i)) {
                Some(attr) => Ok(Some(self.provider.partition_dir(attr)?)),
                None => Ok(None),
            },
            PartitionCursor::Name(name) => Ok(Some(name.clone())),
        }
    }

    /// Moves to the next partition; false when there is none.
    fn advance_partition(&self, cursor: &mut ListFilesToken, current: &str) -> Result<bool> {
        cursor.file_index = 0;
        match &cursor.partition {
            PartitionCursor::Index(i) => {
                let next = i + 1;
                cursor.partition = PartitionCursor::Index(next);
                Ok(cursor
                    .filter_partitions
                    .as_ref()
                    .is_some_and(|f| next < f.len()))
            }
            PartitionCursor::Name(_) => match self.next_partition(cursor.sort_order, Some(current))? {
                Some(next) => {
                    cursor.partition = PartitionCursor::Name(next);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    fn next_partition(&self, order: SortOrder, after: Option<&str>) -> Result<Option<String>> {
        Ok(self
            .provider
            .list_partitions(&self.base_dir, order, after, 1)?
            .into_iter()
            .next())
    }
}

fn sort_names(names: &mut [String], order: SortOrder) {
    match order {
        SortOrder::Asc => names.sort(),
        SortOrder::Desc => names.sort_by(|a, b| b.cmp(a)),
    }
}

/// Regular, non-hidden files of one partition; a missing directory is empty.
fn list_dir_files(dir: &Path, prefix: Option<&str>, order: SortOrder) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if prefix.is_some_and(|p| !name.starts_with(p)) {
            continue;
        }
        names.push(name);
    }
    sort_names(&mut names, order);
    Ok(names)
}
