//! Processed-file ledger backed by SQLite.
//!
//! Holds every recording path already handed to the notification sink,
//! with the time it was first seen.  The whole set is kept in memory and
//! rewritten on each save; it only ever covers a day of recordings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use nvr_common::error::LedgerError;

pub struct ProcessedLedger {
    entries: HashMap<String, DateTime<Utc>>,
    retention: Duration,
    db_path: Option<PathBuf>,
}

impl ProcessedLedger {
    /// Open (or create) the ledger database and load its entries.
    pub fn open(db_path: &Path, retention: Duration) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        initialize(&conn)?;

        let mut entries = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT file_path, first_seen FROM processed_files")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (path, secs) = row?;
                match Utc.timestamp_opt(secs, 0).single() {
                    Some(ts) => {
                        entries.insert(path, ts);
                    }
                    None => warn!("Ignoring ledger row with bad timestamp: {path}"),
                }
            }
        }

        info!(
            "Ledger {} loaded ({} entries)",
            db_path.display(),
            entries.len()
        );
        Ok(Self {
            entries,
            retention,
            db_path: Some(db_path.to_path_buf()),
        })
    }

    /// Ledger that is never persisted.
    pub fn in_memory(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
            db_path: None,
        }
    }

    pub fn has(&self, file_id: &str) -> bool {
        self.entries.contains_key(file_id)
    }

    /// Record `file_id` as processed at `when`.  Returns `false` if it was
    /// already present; the original timestamp is kept in that case.
    pub fn mark_processed(&mut self, file_id: &str, when: DateTime<Utc>) -> bool {
        if self.entries.contains_key(file_id) {
            return false;
        }
        self.entries.insert(file_id.to_string(), when);
        true
    }

    /// Drop entries first seen `retention` or longer before `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries.retain(|_, seen| now - *seen < retention);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Pruned {removed} ledger entries");
        }
        removed
    }

    /// Prune, then overwrite the stored set with the in-memory one.
    pub fn save(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.prune(now);

        let Some(db_path) = &self.db_path else {
            return Ok(());
        };

        let mut conn = Connection::open(db_path)?;
        initialize(&conn)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM processed_files", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO processed_files (file_path, first_seen) VALUES (?1, ?2)")?;
            for (path, seen) in &self.entries {
                stmt.execute(params![path, seen.timestamp()])?;
            }
        }
        tx.commit()?;
        debug!("Ledger saved ({} entries)", self.entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Create the `processed_files` table if it doesn't exist.
fn initialize(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS processed_files (
            file_path  TEXT PRIMARY KEY,
            first_seen INTEGER NOT NULL
        );
    ",
    )?;
    Ok(())
}
