//! Persistent boolean flags keyed by `(group, id)`.
//!
//! Key types are registered up front; a key whose group was never registered
//! is rejected. The file layout is
//! `{"<group>": {"<id>": {"value": bool, "modifiedAt": "<ts>"}}}`.

use crate::core::error::{Result, StoreError};
use crate::core::mapfile::{JsonMap, MapFileOptions, MapFileStore};
use crate::core::time::Clock;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A typed overlay key.
pub trait FlagKey {
    const GROUP: &'static str;

    fn group_id(&self) -> &'static str {
        Self::GROUP
    }

    fn key_id(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    pub value: bool,
    pub modified_at: DateTime<Utc>,
}

pub struct OverlayStoreBuilder {
    path: PathBuf,
    groups: FxHashSet<&'static str>,
}

impl OverlayStoreBuilder {
    pub fn register<K: FlagKey>(mut self) -> Self {
        self.groups.insert(K::GROUP);
        self
    }

    pub fn open(self, clock: Arc<dyn Clock>) -> Result<OverlayStore> {
        if self.groups.is_empty() {
            return Err(StoreError::InvalidRequest(
                "overlay store needs at least one key type".to_string(),
            ));
        }
        let file = MapFileStore::open(self.path, JsonMap::new(), MapFileOptions::default())?;
        Ok(OverlayStore {
            file,
            groups: self.groups,
            clock,
        })
    }
}

pub struct OverlayStore {
    file: MapFileStore,
    groups: FxHashSet<&'static str>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OverlayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayStore")
            .field("file", &self.file)
            .field("groups", &self.groups)
            .finish()
    }
}

impl OverlayStore {
    pub fn builder(path: impl Into<PathBuf>) -> OverlayStoreBuilder {
        OverlayStoreBuilder {
            path: path.into(),
            groups: FxHashSet::default(),
        }
    }

    fn check_group(&self, group: &str) -> Result<()> {
        if self.groups.contains(group) {
            Ok(())
        } else {
            Err(StoreError::InvalidRequest(format!(
                "overlay group {:?} is not registered",
                group
            )))
        }
    }

    pub fn set_flag<K: FlagKey>(&self, key: &K, value: bool) -> Result<FlagRecord> {
        self.check_group(key.group_id())?;
        let record = FlagRecord {
            value,
            modified_at: self.clock.now(),
        };
        let encoded = serde_json::to_value(&record).map_err(|e| StoreError::codec("overlay flag", e))?;
        let id = key.key_id();
        self.file.set_key(&[key.group_id(), id.as_str()], encoded)?;
        Ok(record)
    }

    pub fn get_flag<K: FlagKey>(&self, key: &K) -> Result<Option<FlagRecord>> {
        self.check_group(key.group_id())?;
        let id = key.key_id();
        match self.file.get_key(&[key.group_id(), id.as_str()])? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| StoreError::codec(format!("overlay flag {}/{}", key.group_id(), id), e)),
            None => Ok(None),
        }
    }

    /// All records of one group, keyed by id.
    pub fn group_flags(&self, group: &str) -> Result<BTreeMap<String, FlagRecord>> {
        self.check_group(group)?;
        let mut out = BTreeMap::new();
        if let Some(serde_json::Value::Object(entries)) = self.file.get_key(&[group])? {
            for (id, v) in entries {
                match serde_json::from_value::<FlagRecord>(v) {
                    Ok(rec) => {
                        out.insert(id, rec);
                    }
                    Err(e) => tracing::warn!(group, id = %id, error = %e, "ignoring malformed overlay flag"),
                }
            }
        }
        Ok(out)
    }
}
