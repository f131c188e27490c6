//! SQLite FTS5 engine.
//!
//! One virtual table per engine, with columns declared at open time. The
//! checksum of the declaration lives in a `meta` table; when it changes the
//! table is dropped and recreated empty so the next reconciler repopulates it.
//!
//! Writes go through a single mutex-guarded connection. Reads open a fresh
//! connection each time and run beside the writer under WAL.

use crate::core::db;
use crate::core::error::{Result, StoreError};
use crate::core::token;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hidden doc-id column appended to every table.
pub const PATH_COLUMN: &str = "path";

pub type FtsValues = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct FtsColumn {
    pub name: String,
    /// BM25 weight; 0 is treated as 1.
    pub weight: f64,
    pub unindexed: bool,
}

impl FtsColumn {
    pub fn indexed(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
            unindexed: false,
        }
    }

    pub fn unindexed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 0.0,
            unindexed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FtsRow {
    pub rowid: i64,
    pub values: FtsValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub doc_id: String,
    pub score: f64,
    pub rowid: i64,
    /// Unindexed column values of the row.
    pub values: FtsValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchToken {
    query: String,
    offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchToken {
    order_column: String,
    after_value: String,
    after_rowid: i64,
}

pub struct FtsEngine {
    db_path: PathBuf,
    table: String,
    columns: Vec<FtsColumn>,
    writer: Mutex<Connection>,
    recreated: bool,
}

impl std::fmt::Debug for FtsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtsEngine")
            .field("db_path", &self.db_path)
            .field("table", &self.table)
            .finish()
    }
}

fn check_ident(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidRequest(format!(
            "invalid FTS identifier {:?}",
            name
        )))
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

pub fn schema_checksum(table: &str, columns: &[FtsColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table.as_bytes());
    for col in columns {
        hasher.update(format!("|{}:{}:{}", col.name, col.weight, col.unindexed).as_bytes());
    }
    hasher.update(format!("|{}", PATH_COLUMN).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turns free text into an OR of quoted prefix terms; `None` when no words.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

impl FtsEngine {
    pub fn open(db_path: impl Into<PathBuf>, table: &str, columns: Vec<FtsColumn>) -> Result<Self> {
        check_ident(table)?;
        for col in &columns {
            check_ident(&col.name)?;
            if col.name == PATH_COLUMN {
                return Err(StoreError::InvalidRequest(format!(
                    "column name {:?} is reserved",
                    PATH_COLUMN
                )));
            }
        }
        let db_path = db_path.into();
        let conn = db::db_connect(&db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;

        let checksum = schema_checksum(table, &columns);
        let meta_key = format!("schema_checksum:{}", table);
        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![meta_key], |row| row.get(0))
            .optional()?;

        let mut recreated = false;
        if stored.as_deref() != Some(checksum.as_str()) {
            let mut decls: Vec<String> = columns
                .iter()
                .map(|c| {
                    if c.unindexed {
                        format!("{} UNINDEXED", quote(&c.name))
                    } else {
                        quote(&c.name)
                    }
                })
                .collect();
            decls.push(format!("{} UNINDEXED", quote(PATH_COLUMN)));
            conn.execute_batch(&format!(
                "BEGIN;
                 DROP TABLE IF EXISTS {table};
                 CREATE VIRTUAL TABLE {table} USING fts5({cols}, tokenize = 'unicode61 remove_diacritics 2');
                 INSERT INTO meta(key, value) VALUES('{meta_key}', '{checksum}')
                   ON CONFLICT(key) DO UPDATE SET value = excluded.value;
                 COMMIT;",
                table = quote(table),
                cols = decls.join(", "),
                meta_key = meta_key,
                checksum = checksum,
            ))?;
            recreated = true;
            tracing::info!(table, previous = ?stored, "FTS table (re)created");
        }

        Ok(Self {
            db_path,
            table: table.to_string(),
            columns,
            writer: Mutex::new(conn),
            recreated,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn columns(&self) -> &[FtsColumn] {
        &self.columns
    }

    /// True when `open` had to (re)create the table.
    pub fn was_recreated(&self) -> bool {
        self.recreated
    }

    fn has_column(&self, name: &str) -> bool {
        name == PATH_COLUMN || self.columns.iter().any(|c| c.name == name)
    }

    fn with_writer<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut conn = self.writer.lock().map_err(|_| StoreError::poisoned("FTS writer"))?;
        f(&mut conn)
    }

    fn insert_sql(&self) -> String {
        let mut names: Vec<String> = self.columns.iter().map(|c| quote(&c.name)).collect();
        names.push(quote(PATH_COLUMN));
        let marks: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&self.table),
            names.join(", "),
            marks.join(", ")
        )
    }

    fn row_params<'a>(&'a self, doc_id: &'a str, values: &'a FtsValues) -> Vec<&'a str> {
        let mut out: Vec<&str> = self
            .columns
            .iter()
            .map(|c| values.get(&c.name).map(String::as_str).unwrap_or(""))
            .collect();
        out.push(doc_id);
        out
    }

    /// Replaces the row for `doc_id`, inserting it when absent.
    pub fn upsert(&self, doc_id: &str, values: &FtsValues) -> Result<()> {
        self.upsert_batch(&[(doc_id.to_string(), values.clone())])
    }

    pub fn upsert_batch(&self, docs: &[(String, FtsValues)]) -> Result<()> {
        self.upsert_batch_where(docs, &|_| true).map(|_| ())
    }

    /// Upserts the docs for which `keep` holds, evaluated under the writer
    /// lock so no other write lands between the check and the upsert.
    /// Returns the number written.
    pub fn upsert_batch_where(&self, docs: &[(String, FtsValues)], keep: &dyn Fn(&str) -> bool) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let delete_sql = format!("DELETE FROM {} WHERE {} = ?1", quote(&self.table), quote(PATH_COLUMN));
        let insert_sql = self.insert_sql();
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut delete = tx.prepare_cached(&delete_sql)?;
                let mut insert = tx.prepare_cached(&insert_sql)?;
                for (doc_id, values) in docs.iter().filter(|(id, _)| keep(id)) {
                    delete.execute(params![doc_id])?;
                    insert.execute(params_from_iter(self.row_params(doc_id, values)))?;
                    written += 1;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    pub fn delete(&self, doc_id: &str) -> Result<()> {
        self.delete_batch(&[doc_id.to_string()])
    }

    pub fn delete_batch(&self, doc_ids: &[String]) -> Result<()> {
        if doc_ids.is_empty() {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE {} = ?1", quote(&self.table), quote(PATH_COLUMN));
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for id in doc_ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn reader(&self) -> Result<Connection> {
        db::db_connect_read(&self.db_path)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.reader()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(&self.table)), [], |r| {
            r.get(0)
        })?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Deterministic keyset scan ordered by `(order_column, rowid)`.
    pub fn batch_list(
        &self,
        order_column: &str,
        return_columns: &[&str],
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<FtsRow>, Option<String>)> {
        if !self.has_column(order_column) {
            return Err(StoreError::InvalidRequest(format!("unknown column {:?}", order_column)));
        }
        for col in return_columns {
            if !self.has_column(col) {
                return Err(StoreError::InvalidRequest(format!("unknown column {:?}", col)));
            }
        }
        let after = match token::non_empty(page_token) {
            Some(t) => {
                let tok: BatchToken = token::decode(t)?;
                if tok.order_column != order_column {
                    return Err(StoreError::InvalidRequest(
                        "page token was issued for a different order column".to_string(),
                    ));
                }
                Some((tok.after_value, tok.after_rowid))
            }
            None => None,
        };
        let page_size = page_size.max(1);
        let select_cols: Vec<String> = return_columns.iter().map(|c| quote(c)).collect();
        let order = quote(order_column);
        let select = if select_cols.is_empty() {
            String::new()
        } else {
            format!(", {}", select_cols.join(", "))
        };
        let sql = format!(
            "SELECT rowid, {order}{select} FROM {table}
             WHERE ?1 IS NULL OR {order} > ?1 OR ({order} = ?1 AND rowid > ?2)
             ORDER BY {order}, rowid LIMIT ?3",
            order = order,
            select = select,
            table = quote(&self.table),
        );
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let (after_value, after_rowid) = match &after {
            Some((v, r)) => (Some(v.as_str()), *r),
            None => (None, 0),
        };
        let rows = stmt.query_map(params![after_value, after_rowid, page_size as i64], |row| {
            let rowid: i64 = row.get(0)?;
            let order_value: String = row.get(1)?;
            let mut values = FtsValues::new();
            for (i, col) in return_columns.iter().enumerate() {
                values.insert(col.to_string(), row.get::<_, String>(i + 2)?);
            }
            Ok((rowid, order_value, values))
        })?;
        let mut out = Vec::new();
        let mut last: Option<(String, i64)> = None;
        for row in rows {
            let (rowid, order_value, values) = row?;
            last = Some((order_value, rowid));
            out.push(FtsRow { rowid, values });
        }
        let next = match last {
            Some((after_value, after_rowid)) if out.len() == page_size => Some(token::encode(&BatchToken {
                order_column: order_column.to_string(),
                after_value,
                after_rowid,
            })?),
            _ => None,
        };
        Ok((out, next))
    }

    /// Ranked search; the token is tied to `query` and ignored for another one.
    pub fn search(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<FtsHit>, Option<String>)> {
        let offset = match token::non_empty(page_token) {
            Some(t) => {
                let tok: SearchToken = token::decode(t)?;
                if tok.query == query { tok.offset } else { 0 }
            }
            None => 0,
        };
        let page_size = page_size.max(1);
        let (hits, has_more) = self.search_at(query, offset, page_size)?;
        let next = if has_more {
            Some(self.search_token(query, offset + hits.len())?)
        } else {
            None
        };
        Ok((hits, next))
    }

    pub fn search_token(&self, query: &str, offset: usize) -> Result<String> {
        token::encode(&SearchToken {
            query: query.to_string(),
            offset,
        })
    }

    /// Offset carried by a search token, or 0 when it belongs to another query.
    pub fn search_token_offset(&self, query: &str, page_token: Option<&str>) -> Result<usize> {
        match token::non_empty(page_token) {
            Some(t) => {
                let tok: SearchToken = token::decode(t)?;
                Ok(if tok.query == query { tok.offset } else { 0 })
            }
            None => Ok(0),
        }
    }

    /// Up to `limit` hits starting at `offset`, plus whether more exist.
    pub fn search_at(&self, query: &str, offset: usize, limit: usize) -> Result<(Vec<FtsHit>, bool)> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok((Vec::new(), false));
        };
        let mut weights: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let w = if c.weight == 0.0 { 1.0 } else { c.weight };
                format!("{:.3}", w)
            })
            .collect();
        weights.push("1.0".to_string());
        let extra: Vec<&FtsColumn> = self.columns.iter().filter(|c| c.unindexed).collect();
        let extra_sel: String = extra.iter().map(|c| format!(", {}", quote(&c.name))).collect();
        let sql = format!(
            "SELECT {path}, bm25({table}, {weights}) AS score, rowid{extra}
             FROM {table} WHERE {table} MATCH ?1
             ORDER BY score ASC, rowid ASC LIMIT ?2 OFFSET ?3",
            path = quote(PATH_COLUMN),
            table = quote(&self.table),
            weights = weights.join(", "),
            extra = extra_sel,
        );
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![match_expr, (limit + 1) as i64, offset as i64],
            |row| {
                let mut values = FtsValues::new();
                for (i, col) in extra.iter().enumerate() {
                    values.insert(col.name.clone(), row.get::<_, String>(i + 3)?);
                }
                Ok(FtsHit {
                    doc_id: row.get(0)?,
                    score: row.get(1)?,
                    rowid: row.get(2)?,
                    values,
                })
            },
        )?;
        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        let has_more = hits.len() > limit;
        hits.truncate(limit);
        Ok((hits, has_more))
    }
}
