use super::{fmt_ts, required_ts, ts_column};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

/// Importance at or above this survives every retention sweep.
pub const RETENTION_PROTECTED_IMPORTANCE: u8 = 7;

#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub user_id: i64,
    pub user_message: String,
    pub bot_response: String,
    pub dialogue_context: Option<String>,
    pub importance: u8,
    pub memory_type: String,
    pub tags: Vec<String>,
    pub style_markers: Option<serde_json::Value>,
    pub emotion_primary: Option<String>,
    pub emotion_confidence: Option<f64>,
    pub history_id: Option<i64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: i64,
    pub user_id: i64,
    pub user_message: String,
    pub bot_response: String,
    pub dialogue_context: Option<String>,
    pub importance_score: u8,
    pub memory_type: String,
    pub contextual_tags: Vec<String>,
    pub emotion_primary: Option<String>,
    pub history_id: Option<i64>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub access_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub total: i64,
    pub avg_importance: f64,
    pub user_saved: i64,
    pub auto_saved: i64,
    pub last_memory_at: Option<DateTime<Utc>>,
}

const MEMORY_COLUMNS: &str = "id, user_id, user_message, bot_response, dialogue_context, importance_score, \
     memory_type, contextual_tags, emotion_primary, history_id, session_id, created_at, last_accessed, access_count";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let raw_tags: String = row.get(7)?;
    let contextual_tags: Vec<String> = serde_json::from_str(&raw_tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_message: row.get(2)?,
        bot_response: row.get(3)?,
        dialogue_context: row.get(4)?,
        importance_score: row.get(5)?,
        memory_type: row.get(6)?,
        contextual_tags,
        emotion_primary: row.get(8)?,
        history_id: row.get(9)?,
        session_id: row.get(10)?,
        created_at: required_ts(row, 11)?,
        last_accessed: ts_column(row, 12)?,
        access_count: row.get(13)?,
    })
}

/// Inserts the record and bumps the owner's lifetime save counter.
pub fn insert_memory(conn: &Connection, memory: &NewMemory, now: DateTime<Utc>) -> Result<i64> {
    let tags = serde_json::to_string(&memory.tags).unwrap_or_else(|_| "[]".to_string());
    let style = memory.style_markers.as_ref().map(|v| v.to_string());

    conn.execute(
        "INSERT INTO long_term_memory
            (user_id, user_message, bot_response, dialogue_context, importance_score, memory_type,
             contextual_tags, style_markers, emotion_primary, emotion_confidence, history_id, session_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            memory.user_id,
            memory.user_message,
            memory.bot_response,
            memory.dialogue_context,
            memory.importance,
            memory.memory_type,
            tags,
            style,
            memory.emotion_primary,
            memory.emotion_confidence,
            memory.history_id,
            memory.session_id,
            fmt_ts(now),
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE users SET total_ltm_saves = total_ltm_saves + 1 WHERE user_id = ?1",
        [memory.user_id],
    )?;
    Ok(id)
}

pub fn count_for_user(conn: &Connection, user_id: i64) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memory WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_since(conn: &Connection, user_id: i64, since: DateTime<Utc>) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memory WHERE user_id = ?1 AND created_at >= ?2",
        (user_id, fmt_ts(since)),
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn get_memory(conn: &Connection, memory_id: i64) -> Result<Option<MemoryRecord>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM long_term_memory WHERE id = ?1");
    let record = conn.query_row(&sql, [memory_id], memory_from_row).optional()?;
    Ok(record)
}

/// Every record of the user at or above `min_importance`. Rows that fail to
/// decode are skipped and counted rather than failing the whole read.
pub fn search_candidates(
    conn: &Connection,
    user_id: i64,
    min_importance: u8,
) -> Result<(Vec<MemoryRecord>, usize)> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM long_term_memory
         WHERE user_id = ?1 AND importance_score >= ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((user_id, min_importance), memory_from_row)?;

    let mut results = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        match row {
            Ok(record) => results.push(record),
            Err(e) => {
                tracing::debug!("Memory: skipping undecodable row for user {}: {}", user_id, e);
                skipped += 1;
            }
        }
    }
    Ok((results, skipped))
}

pub fn recent(conn: &Connection, user_id: i64, limit: usize) -> Result<Vec<MemoryRecord>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM long_term_memory
         WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((user_id, limit as i64), memory_from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

/// Highest-importance records created since `since`, newest first among equals.
pub fn top_since(
    conn: &Connection,
    user_id: i64,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<MemoryRecord>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM long_term_memory
         WHERE user_id = ?1 AND created_at >= ?2
         ORDER BY importance_score DESC, created_at DESC, id DESC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((user_id, fmt_ts(since), limit as i64), memory_from_row)?;

    let mut results = Vec::new();
    for row in rows {
        match row {
            Ok(record) => results.push(record),
            Err(e) => tracing::debug!("Memory: skipping undecodable row for user {}: {}", user_id, e),
        }
    }
    Ok(results)
}

pub fn touch(conn: &Connection, memory_ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
    let now = fmt_ts(now);
    let mut stmt = conn.prepare(
        "UPDATE long_term_memory SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
    )?;
    let mut touched = 0;
    for id in memory_ids {
        touched += stmt.execute((&now, id))?;
    }
    Ok(touched)
}

pub fn set_importance(conn: &Connection, memory_id: i64, importance: u8) -> Result<usize> {
    let count = conn.execute(
        "UPDATE long_term_memory SET importance_score = ?1 WHERE id = ?2",
        (importance, memory_id),
    )?;
    Ok(count)
}

pub fn delete_memory(conn: &Connection, user_id: i64, memory_id: i64) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM long_term_memory WHERE id = ?1 AND user_id = ?2",
        (memory_id, user_id),
    )?;
    Ok(count)
}

const RETENTION_PREDICATE: &str = "created_at < ?1
       AND (last_accessed IS NULL OR last_accessed < ?2)
       AND importance_score < ?3";

/// Ids currently matching the retention predicate (point-in-time snapshot).
pub fn retention_candidates(
    conn: &Connection,
    created_before: DateTime<Utc>,
    accessed_before: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let sql = format!("SELECT id FROM long_term_memory WHERE {RETENTION_PREDICATE} ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        (fmt_ts(created_before), fmt_ts(accessed_before), RETENTION_PROTECTED_IMPORTANCE),
        |row| row.get(0),
    )?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

/// Deletes one record only if it still matches the retention predicate, so a
/// record touched or re-rated after the snapshot survives.
pub fn delete_if_expired(
    conn: &Connection,
    memory_id: i64,
    created_before: DateTime<Utc>,
    accessed_before: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!("DELETE FROM long_term_memory WHERE id = ?4 AND {RETENTION_PREDICATE}");
    let count = conn.execute(
        &sql,
        (
            fmt_ts(created_before),
            fmt_ts(accessed_before),
            RETENTION_PROTECTED_IMPORTANCE,
            memory_id,
        ),
    )?;
    Ok(count)
}

pub fn stats(conn: &Connection, user_id: i64) -> Result<MemoryStats> {
    let (total, avg, user_saved, auto_saved, last): (i64, Option<f64>, i64, i64, Option<String>) = conn
        .query_row(
            "SELECT COUNT(*),
                    AVG(importance_score),
                    COALESCE(SUM(CASE WHEN memory_type = 'user_saved' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN memory_type = 'auto_saved' THEN 1 ELSE 0 END), 0),
                    MAX(created_at)
             FROM long_term_memory WHERE user_id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

    Ok(MemoryStats {
        total,
        avg_importance: avg.unwrap_or(0.0),
        user_saved,
        auto_saved,
        last_memory_at: last.as_deref().and_then(super::parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, users};
    use chrono::{Duration, TimeZone};

    fn sample(user_id: i64, importance: u8) -> NewMemory {
        NewMemory {
            user_id,
            user_message: "tell me about the lighthouse".to_string(),
            bot_response: "it has stood since 1822".to_string(),
            importance,
            memory_type: "user_saved".to_string(),
            tags: vec!["lighthouse".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_bumps_lifetime_counter() {
        let db = test_db();
        let conn = db.lock();
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();
        users::ensure_user(&conn, 5, None, now).unwrap();

        let id = insert_memory(&conn, &sample(5, 6), now).unwrap();
        let record = get_memory(&conn, id).unwrap().unwrap();
        assert_eq!(record.contextual_tags, vec!["lighthouse".to_string()]);
        assert_eq!(record.access_count, 0);
        assert_eq!(count_for_user(&conn, 5).unwrap(), 1);
        assert_eq!(users::get_user(&conn, 5).unwrap().unwrap().total_ltm_saves, 1);
    }

    #[test]
    fn test_malformed_tags_are_skipped_not_fatal() {
        let db = test_db();
        let conn = db.lock();
        let now = Utc.with_ymd_and_hms(2026, 4, 2, 9, 0, 0).unwrap();
        insert_memory(&conn, &sample(5, 6), now).unwrap();
        let bad = insert_memory(&conn, &sample(5, 8), now).unwrap();
        conn.execute(
            "UPDATE long_term_memory SET contextual_tags = '{not json' WHERE id = ?1",
            [bad],
        )
        .unwrap();

        let (records, skipped) = search_candidates(&conn, 5, 5).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_delete_if_expired_rechecks_predicate() {
        let db = test_db();
        let conn = db.lock();
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let id = insert_memory(&conn, &sample(1, 3), created).unwrap();

        let created_before = now - Duration::days(365);
        let accessed_before = now - Duration::days(182);
        assert_eq!(retention_candidates(&conn, created_before, accessed_before).unwrap(), vec![id]);

        // Touched after the snapshot was taken
        touch(&conn, &[id], now).unwrap();
        assert_eq!(delete_if_expired(&conn, id, created_before, accessed_before).unwrap(), 0);
        assert!(get_memory(&conn, id).unwrap().is_some());
    }
}
