use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

/// One stored processing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub artist_id: String,
    pub artist_name: String,
    pub catalog_id: Option<String>,
    /// Unix milliseconds; `None` for rows whose timestamp is not numeric.
    pub processed_at: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Fields written by `Ledger::mark_processed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub artist_id: String,
    pub artist_name: String,
    pub catalog_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Durable per-artist processing record plus the in-flight claim set for
/// the current run.
pub struct Ledger {
    conn: Mutex<Connection>,
    claims: Mutex<HashSet<String>>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    warn!(
                        "Could not create ledger directory {}: {}",
                        parent.display(),
                        err
                    );
                }
            }
        }
        let ledger = Self::from_connection(Connection::open(path)?)?;
        info!("Opened processing ledger at {}", path.display());
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        let ledger = Self {
            conn: Mutex::new(conn),
            claims: Mutex::new(HashSet::new()),
        };
        ledger.initialize_schema()?;
        ledger.migrate()?;
        Ok(ledger)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, HashSet<String>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "CREATE TABLE IF NOT EXISTS processed_artists (
                artist_id TEXT PRIMARY KEY,
                artist_name TEXT NOT NULL,
                catalog_id TEXT,
                processed_at INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT
            )",
            [],
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare("PRAGMA table_info(processed_artists)")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        // Databases from the earlier tool named these columns after the catalog vendor.
        for (legacy, current) in [("spotify_id", "catalog_id"), ("processed_date", "processed_at")] {
            let has_legacy = columns.iter().any(|column| column == legacy);
            let has_current = columns.iter().any(|column| column == current);
            if has_legacy && !has_current {
                info!("Migrating ledger column {legacy} -> {current}");
                conn.execute(
                    &format!("ALTER TABLE processed_artists RENAME COLUMN {legacy} TO {current}"),
                    [],
                )?;
            }
        }
        Ok(())
    }

    fn contains(conn: &Connection, artist_id: &str) -> Result<bool, rusqlite::Error> {
        conn.query_row(
            "SELECT 1 FROM processed_artists WHERE artist_id = ?1",
            params![artist_id],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
    }

    /// Whether an entry exists. Storage errors read as "not processed".
    pub fn is_processed(&self, artist_id: &str) -> bool {
        match Self::contains(&self.conn(), artist_id) {
            Ok(found) => found,
            Err(err) => {
                error!("Ledger lookup failed for artist {artist_id}: {err}");
                false
            }
        }
    }

    /// Reserves `artist_id` for this run. Returns `false` when the artist is
    /// already recorded or another worker holds the claim.
    pub fn try_claim(&self, artist_id: &str) -> bool {
        let mut claims = self.claims();
        if claims.contains(artist_id) || self.is_processed(artist_id) {
            return false;
        }
        claims.insert(artist_id.to_string())
    }

    /// Upserts the outcome and releases any claim on the artist.
    pub fn mark_processed(&self, update: &LedgerUpdate) -> Result<(), rusqlite::Error> {
        let mut claims = self.claims();
        let result = self.conn().execute(
            "INSERT INTO processed_artists
                (artist_id, artist_name, catalog_id, processed_at, success, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(artist_id) DO UPDATE SET
                artist_name = excluded.artist_name,
                catalog_id = excluded.catalog_id,
                processed_at = excluded.processed_at,
                success = excluded.success,
                error_message = excluded.error_message",
            params![
                update.artist_id,
                update.artist_name,
                update.catalog_id,
                now_unix_millis(),
                update.success,
                update.error_message
            ],
        );
        claims.remove(&update.artist_id);
        result.map(|_| ())
    }

    pub fn stats(&self) -> LedgerStats {
        let result = self.conn().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0)
             FROM processed_artists",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        );
        match result {
            Ok((total, successful)) => {
                let total = u64::try_from(total).unwrap_or(0);
                let successful = u64::try_from(successful).unwrap_or(0);
                LedgerStats {
                    total,
                    successful,
                    failed: total.saturating_sub(successful),
                }
            }
            Err(err) => {
                error!("Failed to read ledger statistics: {err}");
                LedgerStats::default()
            }
        }
    }

    pub fn entry(&self, artist_id: &str) -> Result<Option<LedgerEntry>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT artist_id, artist_name, catalog_id, processed_at, success, error_message
                 FROM processed_artists WHERE artist_id = ?1",
                params![artist_id],
                |row| {
                    let processed_at = match row.get::<_, Value>(3)? {
                        Value::Integer(millis) => Some(millis),
                        _ => None,
                    };
                    Ok(LedgerEntry {
                        artist_id: row.get(0)?,
                        artist_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        catalog_id: row.get(2)?,
                        processed_at,
                        success: row.get(4)?,
                        error_message: row.get(5)?,
                    })
                },
            )
            .optional()
    }
}

fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
