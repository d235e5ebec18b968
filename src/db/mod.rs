pub mod initiations;
pub mod limits;
pub mod memories;
pub mod users;

use crate::config::Config;
use crate::error::{PersistenceError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use initiations::{InitiationLogRecord, InitiationRecord, ProactivitySettings, ReadyUserRow};
pub use limits::QuotaUsage;
pub use memories::{MemoryRecord, MemoryStats, NewMemory};
pub use users::{AuthLogEntry, PasswordRecord, PasswordStats, UserRecord};

const SCHEMA: &str = include_str!("schema.sql");

pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        if let Some(parent) = Path::new(&config.database_url).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Worker(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(&config.database_url)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.lock();
        conn.execute_batch(SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` inside an IMMEDIATE transaction. Any error rolls back.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Moves a synchronous storage call off the async runtime.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| PersistenceError::Worker(e.to_string()))?
    }

    pub fn load_system_config(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM system_config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn set_system_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO system_config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            (key, value, fmt_ts(Utc::now())),
        )?;
        Ok(())
    }
}

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn fmt_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, TS_FORMAT).ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Reads a nullable timestamp column, failing the row on malformed text.
pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(text) => parse_ts(&text).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("malformed timestamp '{}'", text).into(),
            )
        }),
    }
}

pub(crate) fn required_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    ts_column(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "timestamp".to_string(),
        rusqlite::types::Type::Null,
    ))
}

/// Retries `op` with exponential backoff while it fails with a transient
/// storage error. Anything else is returned unchanged.
pub async fn retry_transient<F, Fut, T>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 4;
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!("{}: attempt {} failed: {}. Retrying in {:?}", label, attempt, e, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.execute_init().unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_db_init_is_idempotent() {
        let db = test_db();
        db.execute_init().unwrap();

        let conn = db.lock();
        let mut stmt = conn.prepare("SELECT 1 FROM long_term_memory").unwrap();
        assert!(!stmt.exists([]).unwrap());
    }

    #[test]
    fn test_system_config_upsert() {
        let db = test_db();
        db.set_system_config("daily_message_limit", "12").unwrap();
        db.set_system_config("daily_message_limit", "15").unwrap();
        db.set_system_config("max_password_attempts", "3").unwrap();

        let pairs = db.load_system_config().unwrap();
        assert_eq!(
            pairs,
            vec![
                ("daily_message_limit".to_string(), "15".to_string()),
                ("max_password_attempts".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_timestamp_format_round_trips_and_orders() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(parse_ts(&fmt_ts(a)), Some(a));
        // Text comparison in SQL relies on this
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts("yesterday"), None);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO system_config (key, value, updated_at) VALUES ('k', 'v', 'now')",
                [],
            )?;
            Err(EngineError::validation("k", "forced"))
        });
        assert!(result.is_err());
        assert!(db.load_system_config().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_transient_retries_busy_only() {
        let calls = AtomicU32::new(0);
        let value = retry_transient("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::from(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                        None,
                    )))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::validation("x", "bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
