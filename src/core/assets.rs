//! Read-only asset trees holding built-in bundles.
//!
//! The built-in cache only needs two things from its input: list every path
//! and read one. Three sources implement that:
//!
//! - [`EmbeddedTree`]: files baked into the binary at compile time
//! - [`DirTree`]: a directory on disk, for operators shipping their own set
//! - [`MemoryTree`]: an in-memory map, for tests
//!
//! Paths are `/`-separated and relative to the tree root.

use crate::core::error::{Result, StoreError};
use rust_embed::RustEmbed;
use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Manifest file at the root of every tree.
pub const MANIFEST_PATH: &str = "bundles.json";

pub trait AssetTree: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Every file path in the tree, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

fn missing(path: &str) -> StoreError {
    StoreError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "asset not found"),
    )
}

/// Built-in prompt bundles compiled into the binary.
#[derive(RustEmbed)]
#[folder = "builtin/prompts/"]
#[include = "*.json"]
pub struct PromptAssets;

/// Built-in tool bundles compiled into the binary.
#[derive(RustEmbed)]
#[folder = "builtin/tools/"]
#[include = "*.json"]
pub struct ToolAssets;

pub struct EmbeddedTree<E: RustEmbed> {
    _embed: PhantomData<fn() -> E>,
}

impl<E: RustEmbed> EmbeddedTree<E> {
    pub fn new() -> Self {
        Self {
            _embed: PhantomData,
        }
    }
}

impl<E: RustEmbed> Default for EmbeddedTree<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: RustEmbed> AssetTree for EmbeddedTree<E> {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        E::get(path)
            .map(|f| f.data.into_owned())
            .ok_or_else(|| missing(path))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = E::iter().map(|p| p.into_owned()).collect();
        paths.sort();
        Ok(paths)
    }
}

#[derive(Debug, Clone)]
pub struct DirTree {
    root: PathBuf,
}

impl DirTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(StoreError::InvalidRequest(format!(
                "asset path {:?} escapes the tree",
                path
            )));
        }
        Ok(self.root.join(path))
    }
}

impl AssetTree for DirTree {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| StoreError::io(full, e))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        walk(&self.root, "", &mut out)?;
        out.sort();
        Ok(out)
    }
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let file_type = entry.file_type().map_err(|e| StoreError::io(entry.path(), e))?;
        if file_type.is_dir() {
            walk(&entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, data);
        self
    }

    pub fn insert(&mut self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.insert(path.trim_start_matches('/').to_string(), data.into());
    }
}

impl AssetTree for MemoryTree {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| missing(path))
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}
