//! Single-file JSON map store.
//!
//! One JSON object per file, cached in memory. Every mutation is written to a
//! temp file in the same directory, fsynced and renamed over the target, and
//! only then are listeners told about it.

use crate::core::error::{Result, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Set,
    Reset,
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct FileEvent<'a> {
    pub op: FileOp,
    pub file: &'a Path,
    /// Contents after the write; `None` for deletes.
    pub data: Option<&'a JsonMap>,
}

pub trait FileListener: Send + Sync {
    fn on_file_event(&self, event: &FileEvent<'_>) -> Result<()>;
}

#[derive(Clone)]
pub struct MapFileOptions {
    pub auto_flush: bool,
    pub create_if_missing: bool,
    pub listeners: Vec<Arc<dyn FileListener>>,
}

impl Default for MapFileOptions {
    fn default() -> Self {
        Self {
            auto_flush: true,
            create_if_missing: true,
            listeners: Vec::new(),
        }
    }
}

pub struct MapFileStore {
    path: PathBuf,
    default: JsonMap,
    options: MapFileOptions,
    cache: RwLock<Option<JsonMap>>,
    write_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for MapFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapFileStore")
            .field("path", &self.path)
            .field("auto_flush", &self.options.auto_flush)
            .finish()
    }
}

impl MapFileStore {
    pub fn open(path: impl Into<PathBuf>, default: JsonMap, options: MapFileOptions) -> Result<Self> {
        let store = Self {
            path: path.into(),
            default,
            options,
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        };
        if store.options.create_if_missing && !store.path.exists() {
            let _guard = store.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
            write_atomic(&store.path, &store.default)?;
            store.replace_cache(store.default.clone())?;
        }
        Ok(store)
    }

    /// Opens a store whose default is `value` serialized as a JSON object.
    pub fn open_typed<T: Serialize>(
        path: impl Into<PathBuf>,
        value: &T,
        options: MapFileOptions,
    ) -> Result<Self> {
        Self::open(path, to_json_map(value)?, options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns a copy of the whole map, re-reading the file when asked to.
    pub fn get_all(&self, force_reload: bool) -> Result<JsonMap> {
        if !force_reload {
            let cache = self.cache.read().map_err(|_| StoreError::poisoned("map file cache"))?;
            if let Some(map) = cache.as_ref() {
                return Ok(map.clone());
            }
        }
        let map = read_map(&self.path)?;
        self.replace_cache(map.clone())?;
        Ok(map)
    }

    pub fn get_as<T: DeserializeOwned>(&self, force_reload: bool) -> Result<T> {
        let map = self.get_all(force_reload)?;
        serde_json::from_value(Value::Object(map))
            .map_err(|e| StoreError::codec(self.path.display().to_string(), e))
    }

    pub fn set_all(&self, map: JsonMap) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        self.commit(map, FileOp::Set)
    }

    pub fn set_as<T: Serialize>(&self, value: &T) -> Result<()> {
        self.set_all(to_json_map(value)?)
    }

    pub fn get_key(&self, key_path: &[&str]) -> Result<Option<Value>> {
        if key_path.is_empty() {
            return Ok(Some(Value::Object(self.get_all(false)?)));
        }
        let map = self.get_all(false)?;
        let mut current = map.get(key_path[0]);
        for segment in &key_path[1..] {
            current = current.and_then(|v| v.as_object()).and_then(|o| o.get(*segment));
        }
        Ok(current.cloned())
    }

    /// Writes `value` at `key_path`, creating intermediate objects.
    pub fn set_key(&self, key_path: &[&str], value: Value) -> Result<()> {
        let Some((last, parents)) = key_path.split_last() else {
            return Err(StoreError::InvalidRequest("empty key path".to_string()));
        };
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        let mut map = self.load_for_write()?;
        let mut target = &mut map;
        for segment in parents {
            let entry = target
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            target = entry.as_object_mut().ok_or_else(|| {
                StoreError::InvalidRequest(format!("key {:?} is not an object", segment))
            })?;
        }
        target.insert(last.to_string(), value);
        self.commit(map, FileOp::Set)
    }

    /// Removes `key_path`; returns whether anything was removed.
    pub fn delete_key(&self, key_path: &[&str]) -> Result<bool> {
        let Some((last, parents)) = key_path.split_last() else {
            return Err(StoreError::InvalidRequest("empty key path".to_string()));
        };
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        let mut map = self.load_for_write()?;
        let mut target = Some(&mut map);
        for segment in parents {
            target = target
                .and_then(|t| t.get_mut(*segment))
                .and_then(|v| v.as_object_mut());
        }
        let removed = match target {
            Some(t) => t.remove(*last).is_some(),
            None => false,
        };
        if removed {
            self.commit(map, FileOp::Set)?;
        }
        Ok(removed)
    }

    /// Rewrites the file with its default contents.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        self.commit(self.default.clone(), FileOp::Reset)
    }

    pub fn delete_file(&self) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        fs::remove_file(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        *self.cache.write().map_err(|_| StoreError::poisoned("map file cache"))? = None;
        self.dirty.store(false, Ordering::SeqCst);
        self.notify(FileOp::Delete, None);
        Ok(())
    }

    /// Writes pending changes of a store opened with `auto_flush = false`.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::poisoned("map file"))?;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let map = self
            .cache
            .read()
            .map_err(|_| StoreError::poisoned("map file cache"))?
            .clone()
            .unwrap_or_else(|| self.default.clone());
        write_atomic(&self.path, &map)?;
        self.notify(FileOp::Set, Some(&map));
        Ok(())
    }

    fn load_for_write(&self) -> Result<JsonMap> {
        {
            let cache = self.cache.read().map_err(|_| StoreError::poisoned("map file cache"))?;
            if let Some(map) = cache.as_ref() {
                return Ok(map.clone());
            }
        }
        match read_map(&self.path) {
            Ok(map) => Ok(map),
            Err(e) if e.is_not_found_io() => Ok(self.default.clone()),
            Err(e) => Err(e),
        }
    }

    // Caller holds `write_lock`.
    fn commit(&self, map: JsonMap, op: FileOp) -> Result<()> {
        if self.options.auto_flush {
            write_atomic(&self.path, &map)?;
            self.replace_cache(map.clone())?;
            self.notify(op, Some(&map));
        } else {
            self.replace_cache(map)?;
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn replace_cache(&self, map: JsonMap) -> Result<()> {
        *self.cache.write().map_err(|_| StoreError::poisoned("map file cache"))? = Some(map);
        Ok(())
    }

    fn notify(&self, op: FileOp, data: Option<&JsonMap>) {
        let event = FileEvent {
            op,
            file: &self.path,
            data,
        };
        for listener in &self.options.listeners {
            if let Err(e) = listener.on_file_event(&event) {
                tracing::error!(file = %self.path.display(), op = ?op, error = %e, "file listener failed");
            }
        }
    }
}

pub fn to_json_map<T: Serialize>(value: &T) -> Result<JsonMap> {
    match serde_json::to_value(value).map_err(|e| StoreError::codec("encode record", e))? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidRequest(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

pub fn read_map(path: &Path) -> Result<JsonMap> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::codec(path.display().to_string(), e))
}

/// Temp file + fsync + rename in the target's directory.
pub fn write_atomic(path: &Path, map: &JsonMap) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let bytes = serde_json::to_vec_pretty(map)
        .map_err(|e| StoreError::codec(path.display().to_string(), e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
