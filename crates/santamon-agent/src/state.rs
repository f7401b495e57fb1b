//! Embedded state store
//!
//! A single SQLite file in WAL mode holds all durable agent state:
//! correlation window events, first-seen patterns, the shipped-signal
//! queue, the processed-file journal, and agent metadata. WAL gives many
//! concurrent readers with a single writer; `sync_writes` trades
//! throughput for fsync-per-commit durability.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use santamon_core::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Row counts and file size, for `db stats` and `status`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub window_events: u64,
    pub window_groups: u64,
    pub first_seen: u64,
    pub queued_signals: u64,
    pub journal_entries: u64,
    pub file_size_bytes: u64,
}

pub struct StateStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    first_seen_max: u64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS window_events (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id    TEXT NOT NULL,
    group_key  TEXT NOT NULL,
    event_time INTEGER,
    event      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_window_group ON window_events(rule_id, group_key, seq);

CREATE TABLE IF NOT EXISTS first_seen (
    rule_id     TEXT NOT NULL,
    pattern     TEXT NOT NULL,
    first_ts    INTEGER NOT NULL,
    last_access INTEGER NOT NULL,
    PRIMARY KEY (rule_id, pattern)
);
CREATE INDEX IF NOT EXISTS idx_first_seen_access ON first_seen(last_access);

CREATE TABLE IF NOT EXISTS shipped_queue (
    id          TEXT PRIMARY KEY,
    enqueued_at INTEGER NOT NULL,
    signal      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS journal (
    path          TEXT PRIMARY KEY,
    first_seen_ts INTEGER NOT NULL,
    size          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

impl StateStore {
    /// Open (or create) the store. The parent directory is created with
    /// owner-only permissions; the database file itself is chmod 0600.
    pub fn open(path: &Path, sync_writes: bool, first_seen_max: u64) -> Result<Self, StorageError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
            }
        }

        let sync_pragma = if sync_writes { "FULL" } else { "NORMAL" };
        let init = format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = {};
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
            sync_pragma
        );

        let manager = SqliteConnectionManager::file(path)
            .with_init(move |c| c.execute_batch(&init));
        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA)?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            first_seen_max,
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // Correlation windows
    // =========================================================================

    pub fn store_window_event(
        &self,
        rule_id: &str,
        group_key: &str,
        event_time: Option<DateTime<Utc>>,
        event: &Value,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO window_events (rule_id, group_key, event_time, event)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                rule_id,
                group_key,
                event_time.map(|t| t.timestamp_millis()),
                serde_json::to_string(event)?,
            ],
        )?;
        Ok(())
    }

    /// Stored events for a group, oldest first.
    pub fn get_window_events(
        &self,
        rule_id: &str,
        group_key: &str,
    ) -> Result<Vec<Value>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event FROM window_events
             WHERE rule_id = ?1 AND group_key = ?2 ORDER BY seq",
        )?;
        let rows: Vec<String> = stmt
            .query_map(params![rule_id, group_key], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for raw in rows {
            events.push(serde_json::from_str(&raw)?);
        }
        Ok(events)
    }

    /// Replace a group's events wholesale; `None` clears the group.
    pub fn replace_window_events(
        &self,
        rule_id: &str,
        group_key: &str,
        events: Option<&[Value]>,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM window_events WHERE rule_id = ?1 AND group_key = ?2",
            params![rule_id, group_key],
        )?;
        if let Some(events) = events {
            let mut stmt = tx.prepare(
                "INSERT INTO window_events (rule_id, group_key, event_time, event)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for event in events {
                let event_time = event
                    .get("event_time")
                    .and_then(|v| v.as_timestamp())
                    .map(|t| t.timestamp_millis());
                stmt.execute(params![
                    rule_id,
                    group_key,
                    event_time,
                    serde_json::to_string(event)?
                ])?;
            }
            drop(stmt);
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop window events outside the retention cutoff for each rule, and
    /// every event belonging to a rule no longer loaded.
    pub fn gc_windows(
        &self,
        retention: &[(String, DateTime<Utc>)],
    ) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let mut dropped = 0u64;

        let known: Vec<&str> = retention.iter().map(|(id, _)| id.as_str()).collect();
        for (rule_id, cutoff) in retention {
            dropped += conn.execute(
                "DELETE FROM window_events
                 WHERE rule_id = ?1 AND (event_time IS NULL OR event_time < ?2)",
                params![rule_id, cutoff.timestamp_millis()],
            )? as u64;
        }

        // Orphaned rule ids (rule removed or disabled since) lose all state.
        let mut stmt = conn.prepare("SELECT DISTINCT rule_id FROM window_events")?;
        let stored: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        for rule_id in stored {
            if !known.contains(&rule_id.as_str()) {
                dropped += conn.execute(
                    "DELETE FROM window_events WHERE rule_id = ?1",
                    params![rule_id],
                )? as u64;
            }
        }

        Ok(dropped)
    }

    // =========================================================================
    // First-seen baseline
    // =========================================================================

    /// Atomic test-and-set: returns `true` only when the pattern was not
    /// present and got inserted by this call. A bounded LRU keeps the table
    /// under `first_seen_max` rows.
    pub fn is_first_seen(&self, rule_id: &str, pattern: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO first_seen (rule_id, pattern, first_ts, last_access)
             VALUES (?1, ?2, ?3, ?3)",
            params![rule_id, pattern, now],
        )? == 1;

        if inserted {
            let count: u64 = tx.query_row("SELECT COUNT(*) FROM first_seen", [], |r| r.get(0))?;
            if count > self.first_seen_max {
                let excess = count - self.first_seen_max;
                tx.execute(
                    "DELETE FROM first_seen WHERE rowid IN (
                         SELECT rowid FROM first_seen ORDER BY last_access ASC LIMIT ?1
                     )",
                    params![excess as i64],
                )?;
            }
        } else {
            tx.execute(
                "UPDATE first_seen SET last_access = ?3 WHERE rule_id = ?1 AND pattern = ?2",
                params![rule_id, pattern, now],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    // =========================================================================
    // Shipped-signal queue
    // =========================================================================

    /// Insert-or-ignore keyed by signal id, so retried pipelines cannot
    /// duplicate queue entries.
    pub fn enqueue_signal(&self, id: &str, signal_json: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO shipped_queue (id, enqueued_at, signal) VALUES (?1, ?2, ?3)",
            params![id, Utc::now().timestamp_millis(), signal_json],
        )?;
        Ok(())
    }

    /// Oldest queued signals first, up to `limit`.
    pub fn list_queued_signals(&self, limit: usize) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, signal FROM shipped_queue ORDER BY enqueued_at, id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn delete_signal(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM shipped_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn queued_count(&self) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM shipped_queue", [], |r| r.get(0))?)
    }

    // =========================================================================
    // Spool journal
    // =========================================================================

    pub fn mark_processed(&self, path: &Path, size: u64) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO journal (path, first_seen_ts, size) VALUES (?1, ?2, ?3)",
            params![
                path.to_string_lossy(),
                Utc::now().timestamp_millis(),
                size as i64
            ],
        )?;
        Ok(())
    }

    pub fn was_processed(&self, path: &Path) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM journal WHERE path = ?1",
                params![path.to_string_lossy()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // =========================================================================
    // Metadata & maintenance
    // =========================================================================

    pub fn meta_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Reclaim space. Safe to run offline; interrupted compaction resumes on
    /// the next call.
    pub fn compact(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")?;
        self.meta_set("last_compaction", &Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<u64, StorageError> {
            Ok(conn.query_row(sql, [], |r| r.get(0))?)
        };
        Ok(StoreStats {
            window_events: count("SELECT COUNT(*) FROM window_events")?,
            window_groups: count(
                "SELECT COUNT(*) FROM (SELECT DISTINCT rule_id, group_key FROM window_events)",
            )?,
            first_seen: count("SELECT COUNT(*) FROM first_seen")?,
            queued_signals: count("SELECT COUNT(*) FROM shipped_queue")?,
            journal_entries: count("SELECT COUNT(*) FROM journal")?,
            file_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        })
    }
}
