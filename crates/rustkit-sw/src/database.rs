//! SQLite persistence for one scope's cache storage.
//!
//! Each scope gets its own database file. All writes go through a
//! transaction that the caller commits before touching in-memory state.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use url::Url;

use crate::cache::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::record::{Headers, RequestDescriptor, ResponseRecord};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// A cache as loaded from disk.
#[derive(Debug)]
pub(crate) struct StoredCache {
    pub id: i64,
    pub name: String,
    pub seq: u64,
    pub entries: Vec<CacheEntry>,
}

/// Open (or create) the database for `scope`.
///
/// Returns the connection and whether the schema was created by this call.
pub(crate) fn init_database(path: &Path, scope: &str) -> CacheResult<(Connection, bool)> {
    let mut conn = Connection::open(path)?;

    conn.pragma_update(None, "foreign_keys", "ON")?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;

    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version > SCHEMA_VERSION {
        return Err(CacheError::persistence(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    let fresh = version < 1;
    if fresh {
        // Tables and metadata land together or not at all.
        let tx = conn.transaction()?;
        create_schema_v1(&tx, scope)?;
        tx.commit()?;
    } else {
        let stored_scope = read_meta(&conn, "scope")?;
        if stored_scope.as_deref() != Some(scope) {
            return Err(CacheError::persistence(format!(
                "database belongs to scope {:?}, not {scope}",
                stored_scope
            )));
        }
    }

    Ok((conn, fresh))
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection, scope: &str) -> CacheResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS storage_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            seq INTEGER PRIMARY KEY,
            cache_id INTEGER NOT NULL REFERENCES caches(id) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            request_headers TEXT NOT NULL,
            status INTEGER NOT NULL,
            status_text TEXT NOT NULL,
            response_headers TEXT NOT NULL,
            body BLOB NOT NULL,
            response_url TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_entries_cache ON entries(cache_id);
        "#,
    )?;

    let now = Utc::now().timestamp();
    conn.execute(
        "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('scope', ?)",
        params![scope],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('created_at', ?)",
        params![now.to_string()],
    )?;
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, now],
    )?;

    Ok(())
}

/// Read a value from the metadata table.
pub(crate) fn read_meta(conn: &Connection, key: &str) -> CacheResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM storage_meta WHERE key = ?",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Read the scope recorded in a database file without migrating it.
pub(crate) fn read_scope(path: &Path) -> CacheResult<Option<String>> {
    let conn = Connection::open(path)?;
    let has_meta: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='storage_meta'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);
    if !has_meta {
        return Ok(None);
    }
    read_meta(&conn, "scope")
}

/// Load every cache with its entries, both in sequence order.
pub(crate) fn load_caches(conn: &Connection) -> CacheResult<Vec<StoredCache>> {
    let mut stmt = conn.prepare("SELECT id, name, seq FROM caches ORDER BY seq, name")?;
    let mut caches = stmt
        .query_map([], |row| {
            Ok(StoredCache {
                id: row.get(0)?,
                name: row.get(1)?,
                seq: row.get::<_, i64>(2)? as u64,
                entries: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT seq, method, url, request_headers, status, status_text,
                response_headers, body, response_url
         FROM entries WHERE cache_id = ? ORDER BY seq",
    )?;
    for cache in &mut caches {
        let rows = stmt
            .query_map(params![cache.id], |row| {
                Ok(EntryRow {
                    seq: row.get(0)?,
                    method: row.get(1)?,
                    url: row.get(2)?,
                    request_headers: row.get(3)?,
                    status: row.get(4)?,
                    status_text: row.get(5)?,
                    response_headers: row.get(6)?,
                    body: row.get(7)?,
                    response_url: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        cache.entries = rows
            .into_iter()
            .map(EntryRow::into_entry)
            .collect::<CacheResult<Vec<_>>>()?;
    }

    Ok(caches)
}

/// Insert a cache row and return its id.
pub(crate) fn insert_cache(conn: &Connection, name: &str, seq: u64) -> CacheResult<i64> {
    conn.execute(
        "INSERT INTO caches (name, seq) VALUES (?, ?)",
        params![name, seq as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Delete a cache; its entries go with it.
pub(crate) fn delete_cache(conn: &Connection, cache_id: i64) -> CacheResult<()> {
    conn.execute("DELETE FROM caches WHERE id = ?", params![cache_id])?;
    Ok(())
}

/// Insert one entry.
pub(crate) fn insert_entry(conn: &Connection, cache_id: i64, entry: &CacheEntry) -> CacheResult<()> {
    let request_headers = encode_headers(entry.request.headers())?;
    let response_headers = encode_headers(entry.response.headers())?;

    conn.execute(
        "INSERT INTO entries (seq, cache_id, method, url, request_headers, status, status_text,
                              response_headers, body, response_url)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            entry.seq as i64,
            cache_id,
            entry.request.method(),
            entry.request.url().as_str(),
            request_headers,
            entry.response.status(),
            entry.response.status_text(),
            response_headers,
            &entry.response.body()[..],
            entry.response.url().map(Url::as_str),
        ],
    )?;
    Ok(())
}

/// Delete entries by sequence number.
pub(crate) fn delete_entries(conn: &Connection, seqs: &[u64]) -> CacheResult<()> {
    let mut stmt = conn.prepare("DELETE FROM entries WHERE seq = ?")?;
    for seq in seqs {
        stmt.execute(params![*seq as i64])?;
    }
    Ok(())
}

fn encode_headers(headers: &Headers) -> CacheResult<String> {
    serde_json::to_string(headers).map_err(|e| CacheError::persistence(e.to_string()))
}

fn decode_headers(json: &str) -> CacheResult<Headers> {
    serde_json::from_str(json).map_err(|e| CacheError::persistence(e.to_string()))
}

struct EntryRow {
    seq: i64,
    method: String,
    url: String,
    request_headers: String,
    status: u16,
    status_text: String,
    response_headers: String,
    body: Vec<u8>,
    response_url: Option<String>,
}

impl EntryRow {
    fn into_entry(self) -> CacheResult<CacheEntry> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::persistence(format!("stored URL {}: {}", self.url, e)))?;
        let request =
            RequestDescriptor::new(&self.method, url).with_headers(decode_headers(&self.request_headers)?);

        let mut response = ResponseRecord::new(
            self.status,
            decode_headers(&self.response_headers)?,
            self.body,
        )
        .with_status_text(self.status_text);
        if let Some(raw) = self.response_url {
            let url = Url::parse(&raw)
                .map_err(|e| CacheError::persistence(format!("stored URL {raw}: {e}")))?;
            response = response.with_url(url);
        }

        Ok(CacheEntry {
            request,
            response,
            seq: self.seq as u64,
        })
    }
}
