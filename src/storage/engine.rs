//! Namespaced key/value engine on top of SQLite
//!
//! Records live in one B-tree keyed by `(collection, key)` and carry a
//! SHA-256 checksum of their JSON payload. Secondary indexes are a second
//! table of `(index_name, key, entry)` rows, so they survive restarts
//! without a reload pass.

use crate::cache::RecordCache;
use crate::crypto::compute_hash;
use crate::error::ChainError;
use crate::transaction::now_millis;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        collection TEXT NOT NULL,
        key TEXT NOT NULL,
        data TEXT NOT NULL,
        checksum TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (collection, key)
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS index_entries (
        index_name TEXT NOT NULL,
        key TEXT NOT NULL,
        entry TEXT NOT NULL,
        UNIQUE (index_name, key, entry)
    );
";

/// On-disk shape of one record, also used for JSON backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub data: serde_json::Value,
    pub timestamp: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub checksum_failures: u64,
    pub cached_records: usize,
    pub cache_capacity: usize,
    pub collections: BTreeMap<String, u64>,
    pub indexes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put {
        collection: String,
        key: String,
        data: String,
    },
    Delete {
        collection: String,
        key: String,
    },
    AddIndex {
        index: String,
        key: String,
        entry: String,
    },
    RemoveIndexKey {
        index: String,
        key: String,
    },
    RemoveIndexEntry {
        index: String,
        key: String,
        entry: String,
    },
    ClearIndex {
        index: String,
    },
    ClearCollection {
        collection: String,
    },
}

/// Group of writes applied in a single SQLite transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize + ?Sized>(&mut self, collection: &str, key: &str, value: &T) -> Result<(), ChainError> {
        self.ops.push(BatchOp::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            data: serde_json::to_string(value)?,
        });
        Ok(())
    }

    pub fn delete(&mut self, collection: &str, key: &str) {
        self.ops.push(BatchOp::Delete {
            collection: collection.to_string(),
            key: key.to_string(),
        });
    }

    pub fn add_index(&mut self, index: &str, key: &str, entry: &str) {
        self.ops.push(BatchOp::AddIndex {
            index: index.to_string(),
            key: key.to_string(),
            entry: entry.to_string(),
        });
    }

    pub fn remove_index_key(&mut self, index: &str, key: &str) {
        self.ops.push(BatchOp::RemoveIndexKey {
            index: index.to_string(),
            key: key.to_string(),
        });
    }

    pub fn remove_index_entry(&mut self, index: &str, key: &str, entry: &str) {
        self.ops.push(BatchOp::RemoveIndexEntry {
            index: index.to_string(),
            key: key.to_string(),
            entry: entry.to_string(),
        });
    }

    pub fn clear_index(&mut self, index: &str) {
        self.ops.push(BatchOp::ClearIndex {
            index: index.to_string(),
        });
    }

    pub fn clear_collection(&mut self, collection: &str) {
        self.ops.push(BatchOp::ClearCollection {
            collection: collection.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub struct StorageEngine {
    conn: Mutex<Connection>,
    cache: RecordCache,
    path: Option<PathBuf>,
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    checksum_failures: AtomicU64,
}

impl StorageEngine {
    pub fn open(path: impl AsRef<Path>, cache_capacity: usize) -> Result<Self, ChainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        let engine = Self::with_connection(conn, cache_capacity, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Storage engine opened");
        Ok(engine)
    }

    pub fn open_in_memory(cache_capacity: usize) -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn, cache_capacity, None)
    }

    fn with_connection(conn: Connection, cache_capacity: usize, path: Option<PathBuf>) -> Result<Self, ChainError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to create schema: {}", e)))?;
        Ok(StorageEngine {
            conn: Mutex::new(conn),
            cache: RecordCache::new(cache_capacity),
            path,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn put<T: Serialize + ?Sized>(&self, collection: &str, key: &str, value: &T) -> Result<(), ChainError> {
        let data = serde_json::to_string(value)?;
        self.put_raw(collection, key, &data)
    }

    pub fn put_raw(&self, collection: &str, key: &str, data: &str) -> Result<(), ChainError> {
        {
            let conn = self.conn.lock();
            insert_record(&conn, collection, key, data)?;
            self.cache
                .put((collection.to_string(), key.to_string()), data.to_string());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>, ChainError> {
        match self.get_raw(collection, key)? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Cache first, then disk. A checksum mismatch is logged and counted but
    /// the stored payload is still returned.
    pub fn get_raw(&self, collection: &str, key: &str) -> Result<Option<String>, ChainError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let cache_key = (collection.to_string(), key.to_string());
        if let Some(data) = self.cache.get(&cache_key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(data));
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        // The cache is filled under the connection lock so a concurrent
        // write cannot be shadowed by the value read here.
        let conn = self.conn.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, checksum FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((data, checksum)) = row else {
            return Ok(None);
        };
        self.check_checksum(collection, key, &data, &checksum);
        self.cache.put(cache_key, data.clone());
        Ok(Some(data))
    }

    fn check_checksum(&self, collection: &str, key: &str, data: &str, checksum: &str) -> bool {
        if compute_hash(data.as_bytes()) == checksum {
            return true;
        }
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
        warn!(collection, key, "Checksum mismatch on stored record");
        false
    }

    pub fn exists(&self, collection: &str, key: &str) -> Result<bool, ChainError> {
        if self.cache.get(&(collection.to_string(), key.to_string())).is_some() {
            return Ok(true);
        }
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete(&self, collection: &str, key: &str) -> Result<bool, ChainError> {
        let removed = {
            let conn = self.conn.lock();
            let removed = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
            )?;
            self.cache.remove(&(collection.to_string(), key.to_string()));
            removed
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(removed > 0)
    }

    /// Records whose key starts with `prefix`, in key order.
    pub fn range<T: DeserializeOwned>(&self, collection: &str, prefix: &str) -> Result<Vec<(String, T)>, ChainError> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT key, data, checksum FROM records
                 WHERE collection = ?1 AND substr(key, 1, length(?2)) = ?2
                 ORDER BY key",
            )?;
            let mapped = stmt.query_map(params![collection, prefix], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };

        self.reads.fetch_add(rows.len() as u64, Ordering::Relaxed);
        let mut out = Vec::with_capacity(rows.len());
        for (key, data, checksum) in rows {
            self.check_checksum(collection, &key, &data, &checksum);
            out.push((key, serde_json::from_str(&data)?));
        }
        Ok(out)
    }

    pub fn list_keys(&self, collection: &str) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM records WHERE collection = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![collection], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn count(&self, collection: &str) -> Result<u64, ChainError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn collections(&self) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT collection FROM records ORDER BY collection")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn clear_collection(&self, collection: &str) -> Result<u64, ChainError> {
        let removed = {
            let conn = self.conn.lock();
            let removed = conn.execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
            self.cache.invalidate_collection(collection);
            removed
        };
        debug!(collection, removed, "Collection cleared");
        Ok(removed as u64)
    }

    /// Keys in `collection` whose payload no longer matches its checksum.
    pub fn verify_collection(&self, collection: &str) -> Result<Vec<String>, ChainError> {
        let rows: Vec<(String, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT key, data, checksum FROM records WHERE collection = ?1 ORDER BY key",
            )?;
            let mapped = stmt.query_map(params![collection], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };
        Ok(rows
            .into_iter()
            .filter(|(key, data, checksum)| !self.check_checksum(collection, key, data, checksum))
            .map(|(key, _, _)| key)
            .collect())
    }

    pub fn add_index_entry(&self, index: &str, key: &str, entry: &str) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO index_entries (index_name, key, entry) VALUES (?1, ?2, ?3)",
            params![index, key, entry],
        )?;
        Ok(())
    }

    /// Entries for `key` in insertion order.
    pub fn get_index(&self, index: &str, key: &str) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entry FROM index_entries WHERE index_name = ?1 AND key = ?2 ORDER BY rowid",
        )?;
        let entries = stmt
            .query_map(params![index, key], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(entries)
    }

    pub fn index_names(&self) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT index_name FROM index_entries ORDER BY index_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Whole index as key -> entries, keys ordered.
    pub fn dump_index(&self, index: &str) -> Result<BTreeMap<String, Vec<String>>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, entry FROM index_entries WHERE index_name = ?1 ORDER BY key, rowid",
        )?;
        let rows = stmt.query_map(params![index], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (key, entry) = row?;
            out.entry(key).or_default().push(entry);
        }
        Ok(out)
    }

    /// Applies every operation in `batch` or none of them.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<(), ChainError> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(|e| {
                ChainError::DatabaseError(format!("Failed to start transaction: {}", e))
            })?;
            for op in &batch.ops {
                match op {
                    BatchOp::Put { collection, key, data } => insert_record(&tx, collection, key, data)?,
                    BatchOp::Delete { collection, key } => {
                        tx.execute(
                            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                            params![collection, key],
                        )?;
                    }
                    BatchOp::AddIndex { index, key, entry } => {
                        tx.execute(
                            "INSERT OR IGNORE INTO index_entries (index_name, key, entry) VALUES (?1, ?2, ?3)",
                            params![index, key, entry],
                        )?;
                    }
                    BatchOp::RemoveIndexKey { index, key } => {
                        tx.execute(
                            "DELETE FROM index_entries WHERE index_name = ?1 AND key = ?2",
                            params![index, key],
                        )?;
                    }
                    BatchOp::RemoveIndexEntry { index, key, entry } => {
                        tx.execute(
                            "DELETE FROM index_entries WHERE index_name = ?1 AND key = ?2 AND entry = ?3",
                            params![index, key, entry],
                        )?;
                    }
                    BatchOp::ClearIndex { index } => {
                        tx.execute("DELETE FROM index_entries WHERE index_name = ?1", params![index])?;
                    }
                    BatchOp::ClearCollection { collection } => {
                        tx.execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
                    }
                }
            }
            tx.commit().map_err(|e| {
                ChainError::DatabaseError(format!("Failed to commit transaction: {}", e))
            })?;

            for op in batch.ops {
                match op {
                    BatchOp::Put { collection, key, data } => {
                        self.cache.put((collection, key), data);
                        self.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    BatchOp::Delete { collection, key } => {
                        self.cache.remove(&(collection, key));
                        self.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    BatchOp::ClearCollection { collection } => self.cache.invalidate_collection(&collection),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Drops the record cache and lets SQLite rebuild its pages.
    pub fn compact(&self) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        self.cache.clear();
        conn.execute_batch("VACUUM;")?;
        info!("Storage compacted");
        Ok(())
    }

    /// Exports every collection and index as JSON files under
    /// `<dir>/backup-<timestamp>/`, plus a consistent copy of the database.
    pub fn backup(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ChainError> {
        let target = dir.as_ref().join(format!("backup-{}", now_millis()));
        fs::create_dir_all(&target)?;

        for collection in self.collections()? {
            let collection_dir = target.join(sanitize_key(&collection));
            fs::create_dir_all(&collection_dir)?;
            for record in self.records(&collection)? {
                let file = collection_dir.join(backup_file_name(&record.key));
                fs::write(file, serde_json::to_vec_pretty(&record)?)?;
            }
        }

        let index_dir = target.join("indexes");
        fs::create_dir_all(&index_dir)?;
        for index in self.index_names()? {
            let file = index_dir.join(format!("{}.json", sanitize_key(&index)));
            fs::write(file, serde_json::to_vec_pretty(&self.dump_index(&index)?)?)?;
        }

        let db_copy = target.join("store.db");
        {
            let conn = self.conn.lock();
            conn.execute("VACUUM INTO ?1", params![db_copy.to_string_lossy().into_owned()])?;
        }

        info!(path = %target.display(), "Storage backup written");
        Ok(target)
    }

    fn records(&self, collection: &str) -> Result<Vec<StoredRecord>, ChainError> {
        let rows: Vec<(String, String, String, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT key, data, checksum, timestamp FROM records WHERE collection = ?1 ORDER BY key",
            )?;
            let mapped = stmt.query_map(params![collection], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect::<Result<_, _>>()?
        };
        rows.into_iter()
            .map(|(key, data, checksum, timestamp)| {
                Ok(StoredRecord {
                    key,
                    data: serde_json::from_str(&data)?,
                    timestamp: timestamp.max(0) as u64,
                    checksum,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> Result<StorageStats, ChainError> {
        let mut collections = BTreeMap::new();
        let mut indexes = BTreeMap::new();
        {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT collection, COUNT(*) FROM records GROUP BY collection")?;
            for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
                let (name, count) = row?;
                collections.insert(name, count as u64);
            }
            let mut stmt =
                conn.prepare("SELECT index_name, COUNT(*) FROM index_entries GROUP BY index_name")?;
            for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
                let (name, count) = row?;
                indexes.insert(name, count as u64);
            }
        }
        let (cached_records, cache_capacity) = self.cache.stats();
        Ok(StorageStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            cached_records,
            cache_capacity,
            collections,
            indexes,
        })
    }
}

fn insert_record(conn: &Connection, collection: &str, key: &str, data: &str) -> Result<(), ChainError> {
    conn.execute(
        "INSERT OR REPLACE INTO records (collection, key, data, checksum, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![collection, key, data, compute_hash(data.as_bytes()), now_millis() as i64],
    )?;
    Ok(())
}

/// Backup file for one record. The hash suffix keeps keys that sanitize to
/// the same name apart.
pub fn backup_file_name(key: &str) -> String {
    format!("{}-{}.json", sanitize_key(key), &compute_hash(key.as_bytes())[..8])
}

/// File-name-safe form of a record key.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
