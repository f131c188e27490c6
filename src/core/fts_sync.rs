//! Reconcilers that make an FTS namespace match some external state.
//!
//! Both reconcilers follow the same shape: load the compare column of every
//! existing row in the namespace, emit decisions, upsert what changed in
//! batches, then delete the rows that existed at the start and were never
//! visited. Rows inserted by a live listener while a pass runs are left alone.

use crate::core::error::Result;
use crate::core::fts::{FtsEngine, FtsValues, PATH_COLUMN};
use crate::core::task::CancelToken;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const LIST_PAGE: usize = 500;
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDecision {
    /// Doc id the decision is about.
    pub id: String,
    /// New compare-column value.
    pub cmp_out: String,
    pub values: FtsValues,
    /// Row is already current; nothing to write.
    pub unchanged: bool,
    /// Not indexable; the id is treated as absent.
    pub skip: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub visited: usize,
    pub upserted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
}

/// Compare-column value of every row whose id satisfies `belongs`.
pub fn load_compare_map(
    engine: &FtsEngine,
    compare_column: &str,
    belongs: &dyn Fn(&str) -> bool,
) -> Result<FxHashMap<String, String>> {
    let mut out = FxHashMap::default();
    let mut token: Option<String> = None;
    loop {
        let (rows, next) =
            engine.batch_list(PATH_COLUMN, &[PATH_COLUMN, compare_column], token.as_deref(), LIST_PAGE)?;
        for mut row in rows {
            let id = row.values.remove(PATH_COLUMN).unwrap_or_default();
            if belongs(&id) {
                let cmp = row.values.remove(compare_column).unwrap_or_default();
                out.insert(id, cmp);
            }
        }
        match next {
            Some(t) => token = Some(t),
            None => return Ok(out),
        }
    }
}

struct Pass<'a> {
    engine: &'a FtsEngine,
    compare_column: &'a str,
    batch_size: usize,
    prev: FxHashMap<String, String>,
    visited: FxHashSet<String>,
    batch: Vec<(String, FtsValues)>,
    /// Source file of each batched doc, for dir passes.
    sources: FxHashMap<String, PathBuf>,
    stats: SyncStats,
}

impl<'a> Pass<'a> {
    fn new(
        engine: &'a FtsEngine,
        compare_column: &'a str,
        batch_size: usize,
        belongs: &dyn Fn(&str) -> bool,
    ) -> Result<Self> {
        Ok(Self {
            engine,
            compare_column,
            batch_size: batch_size.max(1),
            prev: load_compare_map(engine, compare_column, belongs)?,
            visited: FxHashSet::default(),
            batch: Vec::new(),
            sources: FxHashMap::default(),
            stats: SyncStats::default(),
        })
    }

    fn apply(&mut self, mut decision: SyncDecision, source: Option<&Path>) -> Result<()> {
        if decision.skip {
            self.stats.skipped += 1;
            return Ok(());
        }
        self.stats.visited += 1;
        self.visited.insert(decision.id.clone());
        let same = self.prev.get(&decision.id) == Some(&decision.cmp_out);
        if decision.unchanged || same {
            self.stats.unchanged += 1;
            return Ok(());
        }
        decision
            .values
            .insert(self.compare_column.to_string(), decision.cmp_out);
        if let Some(path) = source {
            self.sources.insert(decision.id.clone(), path.to_path_buf());
        }
        self.batch.push((decision.id, decision.values));
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        // A file deleted since it was read has already had its row removed
        // by the listener; upserting it would bring the row back.
        let sources = &self.sources;
        let written = self.engine.upsert_batch_where(&self.batch, &|id| {
            sources.get(id).is_none_or(|path| path.is_file())
        })?;
        self.stats.upserted += written;
        self.stats.skipped += self.batch.len() - written;
        self.batch.clear();
        self.sources.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<SyncStats> {
        self.flush()?;
        let stale: Vec<String> = self
            .prev
            .keys()
            .filter(|id| !self.visited.contains(*id))
            .cloned()
            .collect();
        self.engine.delete_batch(&stale)?;
        self.stats.deleted = stale.len();
        Ok(self.stats)
    }
}

/// Walks `base_dir` and reconciles every regular file through `process_file`.
///
/// `process_file` receives the file path and a lookup returning the stored
/// compare value for a doc id.
pub fn sync_dir_to_fts<F>(
    engine: &FtsEngine,
    base_dir: &Path,
    compare_column: &str,
    batch_size: usize,
    belongs: &dyn Fn(&str) -> bool,
    cancel: &CancelToken,
    mut process_file: F,
) -> Result<SyncStats>
where
    F: FnMut(&Path, &dyn Fn(&str) -> Option<String>) -> Result<SyncDecision>,
{
    let mut pass = Pass::new(engine, compare_column, batch_size, belongs)?;
    let mut files = Vec::new();
    collect_files(base_dir, &mut files)?;
    files.sort();

    for path in files {
        cancel.check()?;
        let prev = &pass.prev;
        let get_prev = |id: &str| prev.get(id).cloned();
        match process_file(&path, &get_prev) {
            Ok(decision) if !decision.skip && !belongs(&decision.id) => {
                tracing::warn!(file = %path.display(), id = %decision.id, "decision outside namespace ignored");
                pass.stats.skipped += 1;
            }
            Ok(decision) => pass.apply(decision, Some(&path))?,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable file during reindex");
                pass.stats.failed += 1;
            }
        }
    }
    pass.finish()
}

/// Reconciles the namespace selected by `belongs` against `decisions`.
pub fn sync_iter_to_fts<I>(
    engine: &FtsEngine,
    compare_column: &str,
    batch_size: usize,
    belongs: &dyn Fn(&str) -> bool,
    cancel: &CancelToken,
    decisions: I,
) -> Result<SyncStats>
where
    I: IntoIterator<Item = Result<SyncDecision>>,
{
    let mut pass = Pass::new(engine, compare_column, batch_size, belongs)?;
    for decision in decisions {
        cancel.check()?;
        match decision {
            Ok(d) if !d.skip && !belongs(&d.id) => {
                tracing::warn!(id = %d.id, "decision outside namespace ignored");
                pass.stats.skipped += 1;
            }
            Ok(d) => pass.apply(d, None)?,
            Err(e) => {
                tracing::warn!(error = %e, "skipping entry during reindex");
                pass.stats.failed += 1;
            }
        }
    }
    pass.finish()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(crate::core::error::StoreError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| crate::core::error::StoreError::io(dir, e))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}
