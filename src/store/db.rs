use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use moka::sync::Cache;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{AfrunError, Result};
use crate::store::document::BatchDocument;
use crate::store::record::{
    decode_payload, encode_payload, format_timestamp, parse_timestamp, sequence_id, Artifacts,
    RecordHeader, SequenceRecord,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS msa (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        payload BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_msa_updated_at ON msa(updated_at);
";

/// Result cap used when the caller does not pass one.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Summary returned by [`ArtifactStore::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub count: u64,
    pub size_bytes: u64,
    pub payload_bytes: u64,
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "path: {}\nrecords: {}\nsize: {}",
            self.path.display(),
            self.count,
            human_size(self.size_bytes)
        )
    }
}

/// Result of [`ArtifactStore::reconcile`].
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub document: BatchDocument,
    /// Chains that received artifacts from the store.
    pub filled: Vec<String>,
    /// Chains with gaps the store could not fill.
    pub missing: Vec<String>,
}

/// Deduplicated MSA/template store keyed by the SHA-256 of the sequence.
///
/// Rows live in a single SQLite table in WAL mode, so a reader never sees a
/// half-written row and is not blocked by a writer. Headers and decoded
/// payloads live in two bounded caches per handle. They are moka caches
/// with TinyLFU admission, so a freshly read entry may be turned away when
/// a cache is full and the next read goes to the table again. A cache entry
/// is dropped right after any committed write or delete of its id. Other
/// handles and processes are not notified, the table stays the source of
/// truth.
pub struct ArtifactStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    headers: Cache<String, RecordHeader>,
    payloads: Cache<String, Arc<SequenceRecord>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore").field("path", &self.path).finish()
    }
}

impl ArtifactStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tracing::info!(dir = %parent.display(), "Creating MSA database directory");
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.path)?;
        Self::bootstrap(config, conn)
    }

    pub fn in_memory() -> Result<Self> {
        let config = StoreConfig::new(":memory:");
        Self::bootstrap(&config, Connection::open_in_memory()?)
    }

    fn bootstrap(config: &StoreConfig, conn: Connection) -> Result<Self> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %config.path.display(), journal_mode = %mode, "Opened MSA database");

        Ok(Self {
            path: config.path.clone(),
            conn: Mutex::new(conn),
            headers: Cache::new(config.header_cache_capacity),
            payloads: Cache::new(config.payload_cache_capacity),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self, id: &str) {
        self.headers.invalidate(id);
        self.payloads.invalidate(id);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or overwrite the record for `sequence`. Returns its id.
    ///
    /// `created_at` is kept from an existing row; `updated_at` is set to now,
    /// and always moves forward for the same id.
    pub fn upsert(&self, sequence: &str, artifacts: Artifacts) -> Result<String> {
        if sequence.trim().is_empty() {
            return Err(AfrunError::Validation(
                "sequence must be a non-empty string".into(),
            ));
        }

        let id = sequence_id(sequence);
        let record = SequenceRecord {
            id: id.clone(),
            sequence: sequence.to_string(),
            artifacts,
        };
        let blob = encode_payload(&record)?;

        {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT updated_at FROM msa WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let mut now = Utc::now();
            if let Some(previous) = previous {
                let previous = parse_timestamp(&id, &previous)?;
                if now <= previous {
                    now = previous + chrono::Duration::microseconds(1);
                }
            }
            let ts = format_timestamp(now);

            tx.execute(
                "INSERT INTO msa (id, created_at, updated_at, payload)
                 VALUES (?1, ?2, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     updated_at = excluded.updated_at,
                     payload = excluded.payload",
                params![id, ts, blob],
            )?;
            tx.commit()?;
            // Still under the connection lock, so no reader can re-cache the old row.
            self.invalidate(&id);
        }

        tracing::debug!(id = %id, bytes = blob.len(), "Upserted MSA record");
        Ok(id)
    }

    pub fn get_header(&self, id: &str) -> Result<Option<RecordHeader>> {
        if let Some(header) = self.headers.get(id) {
            return Ok(Some(header));
        }

        let conn = self.conn();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT id, created_at, updated_at FROM msa WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some(row) => {
                let header = header_from_row(row)?;
                self.headers.insert(id.to_string(), header.clone());
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    pub fn get_payload(&self, id: &str) -> Result<Option<Arc<SequenceRecord>>> {
        if let Some(record) = self.payloads.get(id) {
            return Ok(Some(record));
        }

        let conn = self.conn();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM msa WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(blob) => {
                let record = Arc::new(decode_payload(id, &blob)?);
                self.payloads.insert(id.to_string(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Stored record for a raw sequence, if any.
    pub fn lookup_sequence(&self, sequence: &str) -> Result<Option<Arc<SequenceRecord>>> {
        self.get_payload(&sequence_id(sequence))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM msa WHERE id = ?1", params![id])?;
        self.invalidate(id);
        drop(conn);
        if removed > 0 {
            tracing::info!(id, "Deleted MSA record");
        }
        Ok(removed > 0)
    }

    /// Headers, most recently updated first.
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<RecordHeader>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, updated_at FROM msa
             ORDER BY updated_at DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![to_sql_int(limit), to_sql_int(offset)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<(String, String, String)>, _>>()?;
        rows.into_iter().map(header_from_row).collect()
    }

    /// Ids containing `query`, ignoring case, most recently updated first.
    /// An empty query matches nothing.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM msa
             WHERE LOWER(id) LIKE ?1 ESCAPE '\\'
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![pattern, to_sql_int(limit)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM msa", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Total size of the compressed payloads.
    pub fn payload_bytes(&self) -> Result<u64> {
        let size: Option<i64> = self.conn().query_row(
            "SELECT SUM(LENGTH(payload)) FROM msa",
            [],
            |row| row.get(0),
        )?;
        Ok(size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0))
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStatus {
            path: self.path.clone(),
            count: self.count()?,
            size_bytes,
            payload_bytes: self.payload_bytes()?,
        })
    }

    /// Store the protein chains of `document`. Returns the ids written.
    ///
    /// Unless `force` is set, a chain whose sequence is already stored is
    /// skipped. Chains lacking artifacts are still stored, with a warning.
    pub fn import_document(&self, document: &BatchDocument, force: bool) -> Result<Vec<String>> {
        if document.sequences.is_empty() {
            return Err(AfrunError::Validation(
                "document does not contain any sequences".into(),
            ));
        }

        let mut imported = Vec::new();
        for entry in &document.sequences {
            let Some(chain) = entry.protein.as_ref() else {
                tracing::warn!(entry = ?entry.other.keys().collect::<Vec<_>>(), "Skipping non-protein entry");
                continue;
            };
            if chain.sequence.trim().is_empty() {
                tracing::warn!(chain = %chain.label(), "Skipping chain without a sequence");
                continue;
            }

            let id = sequence_id(&chain.sequence);
            if !force && self.get_header(&id)?.is_some() {
                tracing::warn!(chain = %chain.label(), id = %id, "Sequence already stored, use --force to overwrite");
                continue;
            }

            let artifacts = chain.artifacts();
            let missing = artifacts.missing();
            if !missing.is_empty() {
                tracing::warn!(chain = %chain.label(), id = %id, missing = ?missing, "Importing chain with missing artifacts");
            }

            imported.push(self.upsert(&chain.sequence, artifacts)?);
        }
        Ok(imported)
    }

    pub fn import_file(&self, path: &Path, force: bool) -> Result<Vec<String>> {
        let document = BatchDocument::load(path)?;
        tracing::info!(path = %path.display(), "Importing document");
        self.import_document(&document, force)
    }

    pub fn import_files(&self, paths: &[PathBuf], force: bool) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for (idx, path) in paths.iter().enumerate() {
            tracing::info!(progress = %format!("{}/{}", idx + 1, paths.len()), "Importing JSON files");
            ids.extend(self.import_file(path, force)?);
        }
        Ok(ids)
    }

    /// Fill artifact gaps in `document` from the store.
    ///
    /// A chain whose sequence is not stored keeps its gaps and is reported in
    /// [`Reconciled::missing`]; this never fails for lookups that miss.
    pub fn reconcile(&self, document: &BatchDocument) -> Result<Reconciled> {
        let mut document = document.clone();
        let mut filled = Vec::new();
        let mut missing = Vec::new();

        for entry in document.sequences.iter_mut() {
            let Some(chain) = entry.protein.as_mut() else {
                continue;
            };
            let mut artifacts = chain.artifacts();
            if artifacts.is_complete() {
                tracing::info!(chain = %chain.label(), "Chain already has all artifacts, leaving it unchanged");
                continue;
            }
            if chain.sequence.trim().is_empty() {
                tracing::warn!(chain = %chain.label(), "Chain has no sequence to look up");
                missing.push(chain.label());
                continue;
            }

            let id = sequence_id(&chain.sequence);
            match self.get_payload(&id)? {
                Some(stored) => {
                    artifacts.fill_from(&stored.artifacts);
                    chain.set_artifacts(artifacts);
                    tracing::info!(chain = %chain.label(), id = %id, "Filled artifacts from store");
                    filled.push(chain.label());
                }
                None => {
                    tracing::warn!(chain = %chain.label(), id = %id, "Sequence not found in store, import it first");
                    missing.push(chain.label());
                }
            }
        }

        Ok(Reconciled {
            document,
            filled,
            missing,
        })
    }

    pub fn reconcile_file(&self, path: &Path) -> Result<Reconciled> {
        if !path.is_file() {
            return Err(AfrunError::Validation(format!(
                "document {} does not exist",
                path.display()
            )));
        }
        self.reconcile(&BatchDocument::load(path)?)
    }
}

fn header_from_row((id, created_at, updated_at): (String, String, String)) -> Result<RecordHeader> {
    Ok(RecordHeader {
        created_at: parse_timestamp(&id, &created_at)?,
        updated_at: parse_timestamp(&id, &updated_at)?,
        id,
    })
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn to_sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Size with a binary unit, e.g. `1.50 KB`.
pub fn human_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} PB", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_like_wildcards() {
        assert_eq!(escape_like("a%b_c\\"), "a\\%b\\_c\\\\");
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(0), "0.00 B");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.00 MB");
    }
}
