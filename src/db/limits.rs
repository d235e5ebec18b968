use super::{fmt_day, fmt_ts};
use crate::error::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub exceeded: bool,
}

impl QuotaUsage {
    pub fn new(count: u32, limit: u32) -> Self {
        Self {
            count,
            limit,
            remaining: limit.saturating_sub(count),
            exceeded: count >= limit,
        }
    }
}

/// Adds one unit to the (user, day, kind) counter if it is still below
/// `limit`. A single conditional upsert, so concurrent callers cannot both
/// take the last unit. Returns the new count, or `None` when denied.
pub fn try_increment(
    conn: &Connection,
    user_id: i64,
    day: NaiveDate,
    kind: &str,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<Option<u32>> {
    if limit == 0 {
        return Ok(None);
    }

    let new_count: Option<u32> = conn
        .query_row(
            "INSERT INTO rate_counters (user_id, day, kind, count, updated_at)
             VALUES (?1, ?2, ?3, 1, ?5)
             ON CONFLICT(user_id, day, kind) DO UPDATE
                SET count = count + 1, updated_at = ?5
                WHERE count < ?4
             RETURNING count",
            (user_id, fmt_day(day), kind, limit, fmt_ts(now)),
            |row| row.get(0),
        )
        .optional()?;
    Ok(new_count)
}

pub fn current_count(conn: &Connection, user_id: i64, day: NaiveDate, kind: &str) -> Result<u32> {
    let count = conn
        .query_row(
            "SELECT count FROM rate_counters WHERE user_id = ?1 AND day = ?2 AND kind = ?3",
            (user_id, fmt_day(day), kind),
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

pub fn purge_before(conn: &Connection, cutoff: NaiveDate) -> Result<usize> {
    let count = conn.execute("DELETE FROM rate_counters WHERE day < ?1", [fmt_day(cutoff)])?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::TimeZone;

    #[test]
    fn test_conditional_upsert_stops_at_limit() {
        let db = test_db();
        let conn = db.lock();
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 8, 0, 0).unwrap();
        let day = now.date_naive();

        assert_eq!(try_increment(&conn, 1, day, "message", 2, now).unwrap(), Some(1));
        assert_eq!(try_increment(&conn, 1, day, "message", 2, now).unwrap(), Some(2));
        assert_eq!(try_increment(&conn, 1, day, "message", 2, now).unwrap(), None);
        assert_eq!(current_count(&conn, 1, day, "message").unwrap(), 2);

        // Kinds and users are independent keys
        assert_eq!(try_increment(&conn, 1, day, "auto_save", 2, now).unwrap(), Some(1));
        assert_eq!(try_increment(&conn, 2, day, "message", 2, now).unwrap(), Some(1));
        assert_eq!(try_increment(&conn, 3, day, "message", 0, now).unwrap(), None);
        assert_eq!(current_count(&conn, 3, day, "message").unwrap(), 0);
    }

    #[test]
    fn test_purge_before() {
        let db = test_db();
        let conn = db.lock();
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2026, 1, 20, 8, 0, 0).unwrap();
        try_increment(&conn, 1, old.date_naive(), "message", 5, old).unwrap();
        try_increment(&conn, 1, new.date_naive(), "message", 5, new).unwrap();

        let deleted = purge_before(&conn, new.date_naive()).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(current_count(&conn, 1, new.date_naive(), "message").unwrap(), 1);
    }

    #[test]
    fn test_usage_math() {
        let usage = QuotaUsage::new(12, 10);
        assert_eq!(usage.remaining, 0);
        assert!(usage.exceeded);
        assert!(!QuotaUsage::new(3, 10).exceeded);
    }
}
