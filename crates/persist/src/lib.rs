//! kcal persistence: a small document store addressed by collection name.
//! Records are flat JSON maps; the store enforces no schema. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

/// A stored record.
pub type Doc = serde_json::Map<String, Value>;

pub const CALENDAR_EVENTS: &str = "calendar_events";
pub const SCALED_OBJECTS: &str = "scaled_objects";
pub const DEPLOYMENTS: &str = "deployments";
pub const DUAL_WRITE_LOG: &str = "dual_write_log";

/// Store-assigned row key, injected into every record read back.
pub const INTERNAL_ID: &str = "_id";

/// Conjunction of field equalities. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self { Self::default() }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool { self.clauses.is_empty() }

    pub fn matches(&self, doc: &Doc) -> bool {
        self.clauses.iter().all(|(k, v)| doc.get(k) == Some(v))
    }
}

/// Field selection applied to records returned by `find_all`.
#[derive(Debug, Clone, Copy, Default)]
pub enum Projection<'a> {
    #[default]
    All,
    Only(&'a [&'a str]),
    Without(&'a [&'a str]),
}

impl Projection<'_> {
    pub fn apply(&self, mut doc: Doc) -> Doc {
        match self {
            Projection::All => doc,
            Projection::Only(keep) => {
                doc.retain(|k, _| keep.contains(&k.as_str()));
                doc
            }
            Projection::Without(skip) => {
                doc.retain(|k, _| !skip.contains(&k.as_str()));
                doc
            }
        }
    }
}

/// Document-store contract. Each call touches at most one record atomically;
/// nothing spans more than one call.
pub trait Store: Send + Sync {
    fn insert_one(&self, collection: &str, doc: Doc) -> Result<()>;
    /// Return up to `limit` records in insertion order.
    fn find_all(&self, collection: &str, projection: Projection<'_>, limit: usize) -> Result<Vec<Doc>>;
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Doc>>;
    /// Merge `set` into the first matching record. Returns the number of records matched (0 or 1).
    fn update_one(&self, collection: &str, filter: &Filter, set: Doc) -> Result<u64>;
    /// Returns the number of records deleted (0 or 1).
    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64>;
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
}

fn with_row_id(mut doc: Doc, row: i64) -> Doc {
    doc.insert(INTERNAL_ID.to_string(), Value::from(row));
    doc
}

fn merge(target: &mut Doc, set: Doc) {
    for (k, v) in set {
        if k != INTERNAL_ID {
            target.insert(k, v);
        }
    }
}

// ----------------- SQLite -----------------

/// SQLite-backed store. Simple, synchronous: one `records` table keyed by collection.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KCAL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                doc        TEXT NOT NULL
            )",
            [],
        ).context("creating records table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection)", []).ok();
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    fn scan(db: &rusqlite::Connection, collection: &str) -> Result<Vec<(i64, Doc)>> {
        let mut stmt = db.prepare_cached("SELECT rowid, doc FROM records WHERE collection = ?1 ORDER BY rowid")?;
        let mut rows = stmt.query([collection])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let text: String = row.get(1)?;
            let doc: Doc = serde_json::from_str(&text)
                .with_context(|| format!("decoding record {} in {}", rowid, collection))?;
            out.push((rowid, doc));
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn insert_one(&self, collection: &str, mut doc: Doc) -> Result<()> {
        let started = std::time::Instant::now();
        doc.remove(INTERNAL_ID);
        let text = serde_json::to_string(&doc)?;
        let db = self.conn()?;
        db.execute("INSERT INTO records(collection, doc) VALUES (?1, ?2)", (collection, &text))
            .with_context(|| format!("inserting into {}", collection))?;
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_write_total", 1u64);
        Ok(())
    }

    fn find_all(&self, collection: &str, projection: Projection<'_>, limit: usize) -> Result<Vec<Doc>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let out: Vec<Doc> = Self::scan(&db, collection)?
            .into_iter()
            .take(limit)
            .map(|(row, doc)| projection.apply(with_row_id(doc, row)))
            .collect();
        histogram!("store_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Doc>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let found = Self::scan(&db, collection)?
            .into_iter()
            .find(|(_, doc)| filter.matches(doc))
            .map(|(row, doc)| with_row_id(doc, row));
        histogram!("store_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(found)
    }

    fn update_one(&self, collection: &str, filter: &Filter, set: Doc) -> Result<u64> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let hit = Self::scan(&tx, collection)?.into_iter().find(|(_, doc)| filter.matches(doc));
        let Some((rowid, mut doc)) = hit else {
            return Ok(0);
        };
        merge(&mut doc, set);
        let text = serde_json::to_string(&doc)?;
        tx.execute("UPDATE records SET doc = ?1 WHERE rowid = ?2", (&text, rowid))?;
        tx.commit()?;
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_write_total", 1u64);
        Ok(1)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let hit = Self::scan(&tx, collection)?.into_iter().find(|(_, doc)| filter.matches(doc));
        let Some((rowid, _)) = hit else {
            return Ok(0);
        };
        let n = tx.execute("DELETE FROM records WHERE rowid = ?1", [rowid])?;
        tx.commit()?;
        histogram!("store_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_write_total", 1u64);
        Ok(n as u64)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let db = self.conn()?;
        if filter.is_empty() {
            let n: i64 = db.query_row("SELECT COUNT(*) FROM records WHERE collection = ?1", [collection], |r| r.get(0))?;
            return Ok(n as u64);
        }
        let n = Self::scan(&db, collection)?.iter().filter(|(_, doc)| filter.matches(doc)).count();
        Ok(n as u64)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kcal");
        let _ = std::fs::create_dir_all(&p);
        p.push("kcal.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "kcal.db".to_string()
}

// ----------------- In-memory -----------------

#[derive(Default)]
struct MemInner {
    next_row: i64,
    collections: BTreeMap<String, Vec<(i64, Doc)>>,
}

/// Process-local store for ephemeral runs and tests.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> Result<MutexGuard<'_, MemInner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

impl Store for MemStore {
    fn insert_one(&self, collection: &str, mut doc: Doc) -> Result<()> {
        doc.remove(INTERNAL_ID);
        let mut inner = self.lock()?;
        inner.next_row += 1;
        let row = inner.next_row;
        inner.collections.entry(collection.to_string()).or_default().push((row, doc));
        debug!(collection, row, "mem insert");
        Ok(())
    }

    fn find_all(&self, collection: &str, projection: Projection<'_>, limit: usize) -> Result<Vec<Doc>> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .take(limit)
                    .map(|(row, doc)| projection.apply(with_row_id(doc.clone(), *row)))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Doc>> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|rows| rows.iter().find(|(_, doc)| filter.matches(doc)))
            .map(|(row, doc)| with_row_id(doc.clone(), *row)))
    }

    fn update_one(&self, collection: &str, filter: &Filter, set: Doc) -> Result<u64> {
        let mut inner = self.lock()?;
        let hit = inner
            .collections
            .get_mut(collection)
            .and_then(|rows| rows.iter_mut().find(|(_, doc)| filter.matches(doc)));
        match hit {
            Some((_, doc)) => {
                merge(doc, set);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut inner = self.lock()?;
        let Some(rows) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        match rows.iter().position(|(_, doc)| filter.matches(doc)) {
            Some(idx) => {
                rows.remove(idx);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let inner = self.lock()?;
        let n = inner
            .collections
            .get(collection)
            .map(|rows| rows.iter().filter(|(_, doc)| filter.matches(doc)).count())
            .unwrap_or(0);
        Ok(n as u64)
    }
}
