use super::{fmt_ts, required_ts, ts_column};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Longest stored response text; the full length is kept separately.
pub const MAX_STORED_RESPONSE_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ProactivitySettings {
    pub user_id: i64,
    pub is_enabled: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub ab_test_group: String,
    pub timezone: String,
    pub updated_at: DateTime<Utc>,
}

impl ProactivitySettings {
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| until >= now)
    }
}

/// One eligibility-scan candidate, before pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyUserRow {
    pub user_id: i64,
    pub last_active: DateTime<Utc>,
    pub memory_count_30d: u32,
    pub timezone: String,
    pub ab_test_group: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiationRecord {
    pub id: i64,
    pub user_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub initiation_type: String,
    pub status: String,
    pub source_memory_ids: Vec<i64>,
    pub emotion_context: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub user_response_received: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitiationLogRecord {
    pub id: i64,
    pub user_id: i64,
    pub initiation_id: Option<i64>,
    pub initiation_type: String,
    pub message_content: String,
    pub sent_at: DateTime<Utc>,
    pub user_responded: bool,
    pub user_response: Option<String>,
    pub user_response_emotion: Option<String>,
    pub user_response_sentiment: Option<f64>,
    pub user_response_length: Option<i64>,
    pub response_time_minutes: Option<i64>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Outcome fields written when a user answers an initiation.
#[derive(Debug, Clone)]
pub struct ResponseOutcome<'a> {
    pub response: &'a str,
    pub emotion: Option<&'a str>,
    pub sentiment: f64,
    pub response_time_minutes: i64,
    pub responded_at: DateTime<Utc>,
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<ProactivitySettings> {
    Ok(ProactivitySettings {
        user_id: row.get(0)?,
        is_enabled: row.get(1)?,
        paused_until: ts_column(row, 2)?,
        pause_reason: row.get(3)?,
        ab_test_group: row.get(4)?,
        timezone: row.get(5)?,
        updated_at: required_ts(row, 6)?,
    })
}

const INITIATION_COLUMNS: &str = "id, user_id, scheduled_at, initiation_type, status, source_memory_ids, \
     emotion_context, sent_at, error_message, user_response_received, created_at";

fn initiation_from_row(row: &Row<'_>) -> rusqlite::Result<InitiationRecord> {
    let raw_ids: String = row.get(5)?;
    let source_memory_ids: Vec<i64> = serde_json::from_str(&raw_ids)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(InitiationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scheduled_at: required_ts(row, 2)?,
        initiation_type: row.get(3)?,
        status: row.get(4)?,
        source_memory_ids,
        emotion_context: row.get(6)?,
        sent_at: ts_column(row, 7)?,
        error_message: row.get(8)?,
        user_response_received: row.get(9)?,
        created_at: required_ts(row, 10)?,
    })
}

const LOG_COLUMNS: &str = "id, user_id, initiation_id, initiation_type, message_content, created_at, \
     user_responded, user_response, user_response_emotion, user_response_sentiment, \
     user_response_length, response_time_minutes, responded_at";

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<InitiationLogRecord> {
    Ok(InitiationLogRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        initiation_id: row.get(2)?,
        initiation_type: row.get(3)?,
        message_content: row.get(4)?,
        sent_at: required_ts(row, 5)?,
        user_responded: row.get(6)?,
        user_response: row.get(7)?,
        user_response_emotion: row.get(8)?,
        user_response_sentiment: row.get(9)?,
        user_response_length: row.get(10)?,
        response_time_minutes: row.get(11)?,
        responded_at: ts_column(row, 12)?,
    })
}

// Settings

pub fn get_settings(conn: &Connection, user_id: i64) -> Result<Option<ProactivitySettings>> {
    let settings = conn
        .query_row(
            "SELECT user_id, is_enabled, paused_until, pause_reason, ab_test_group, timezone, updated_at
             FROM proactivity_settings WHERE user_id = ?1",
            [user_id],
            settings_from_row,
        )
        .optional()?;
    Ok(settings)
}

/// Enabling also lifts any pause; disabling leaves the pause window alone.
pub fn set_enabled(conn: &Connection, user_id: i64, enabled: bool, now: DateTime<Utc>) -> Result<()> {
    if enabled {
        conn.execute(
            "INSERT INTO proactivity_settings (user_id, is_enabled, updated_at) VALUES (?1, TRUE, ?2)
             ON CONFLICT(user_id) DO UPDATE
                SET is_enabled = TRUE, paused_until = NULL, pause_reason = NULL, updated_at = ?2",
            (user_id, fmt_ts(now)),
        )?;
    } else {
        conn.execute(
            "INSERT INTO proactivity_settings (user_id, is_enabled, updated_at) VALUES (?1, FALSE, ?2)
             ON CONFLICT(user_id) DO UPDATE SET is_enabled = FALSE, updated_at = ?2",
            (user_id, fmt_ts(now)),
        )?;
    }
    Ok(())
}

pub fn set_pause(
    conn: &Connection,
    user_id: i64,
    until: Option<DateTime<Utc>>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO proactivity_settings (user_id, paused_until, pause_reason, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE
            SET paused_until = ?2, pause_reason = ?3, updated_at = ?4",
        (user_id, until.map(fmt_ts), reason, fmt_ts(now)),
    )?;
    Ok(())
}

pub fn set_timezone(conn: &Connection, user_id: i64, timezone: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO proactivity_settings (user_id, timezone, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET timezone = ?2, updated_at = ?3",
        (user_id, timezone, fmt_ts(now)),
    )?;
    Ok(())
}

// Eligibility

/// Enabled, unpaused users with a live session whose last activity falls in
/// `[active_before_max, active_before_min]`, ordered by memory count since
/// `memory_since` desc, then longest silence first. Undecodable rows are
/// skipped and counted.
pub fn ready_users(
    conn: &Connection,
    now: DateTime<Utc>,
    active_after: DateTime<Utc>,
    active_before: DateTime<Utc>,
    memory_since: DateTime<Utc>,
) -> Result<(Vec<ReadyUserRow>, usize)> {
    let mut stmt = conn.prepare(
        "SELECT s.user_id, a.last_active, s.timezone, s.ab_test_group,
                (SELECT COUNT(*) FROM long_term_memory m
                  WHERE m.user_id = s.user_id AND m.created_at >= ?4) AS memory_count
         FROM proactivity_settings s
         JOIN users u ON u.user_id = s.user_id
         JOIN activity_stats a ON a.user_id = s.user_id
         WHERE s.is_enabled = TRUE
           AND (s.paused_until IS NULL OR s.paused_until < ?1)
           AND u.authorized_until IS NOT NULL AND u.authorized_until > ?1
           AND a.last_active >= ?2 AND a.last_active <= ?3
         ORDER BY memory_count DESC, a.last_active ASC, s.user_id ASC",
    )?;
    let rows = stmt.query_map(
        (fmt_ts(now), fmt_ts(active_after), fmt_ts(active_before), fmt_ts(memory_since)),
        |row| {
            Ok(ReadyUserRow {
                user_id: row.get(0)?,
                last_active: required_ts(row, 1)?,
                timezone: row.get(2)?,
                ab_test_group: row.get(3)?,
                memory_count_30d: row.get(4)?,
            })
        },
    )?;

    let mut results = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        match row {
            Ok(candidate) => results.push(candidate),
            Err(e) => {
                tracing::debug!("Proactive: skipping undecodable candidate row: {}", e);
                skipped += 1;
            }
        }
    }
    Ok((results, skipped))
}

// Schedule

pub fn insert_initiation(
    conn: &Connection,
    user_id: i64,
    scheduled_at: DateTime<Utc>,
    initiation_type: &str,
    source_memory_ids: &[i64],
    emotion_context: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let ids = serde_json::to_string(source_memory_ids).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO initiation_schedule
            (user_id, scheduled_at, initiation_type, status, source_memory_ids, emotion_context, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
        (user_id, fmt_ts(scheduled_at), initiation_type, ids, emotion_context, fmt_ts(now)),
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_initiation(conn: &Connection, initiation_id: i64) -> Result<Option<InitiationRecord>> {
    let sql = format!("SELECT {INITIATION_COLUMNS} FROM initiation_schedule WHERE id = ?1");
    let record = conn.query_row(&sql, [initiation_id], initiation_from_row).optional()?;
    Ok(record)
}

/// Pending entries due at `now` with no delivery error attached, oldest first.
pub fn due(conn: &Connection, now: DateTime<Utc>, limit: usize) -> Result<(Vec<InitiationRecord>, usize)> {
    let sql = format!(
        "SELECT {INITIATION_COLUMNS} FROM initiation_schedule
         WHERE status = 'pending' AND error_message IS NULL AND scheduled_at <= ?1
         ORDER BY scheduled_at ASC, id ASC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((fmt_ts(now), limit as i64), initiation_from_row)?;

    let mut results = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        match row {
            Ok(record) => results.push(record),
            Err(e) => {
                tracing::debug!("Proactive: skipping undecodable initiation row: {}", e);
                skipped += 1;
            }
        }
    }
    Ok((results, skipped))
}

/// Moves a pending entry to sent and opens its outcome log. Returns false
/// when the entry is not pending.
pub fn mark_sent(
    conn: &Connection,
    initiation: &InitiationRecord,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE initiation_schedule SET status = 'sent', sent_at = ?1, error_message = NULL
         WHERE id = ?2 AND status = 'pending'",
        (fmt_ts(now), initiation.id),
    )?;
    if updated == 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO initiation_logs (user_id, initiation_id, initiation_type, message_content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (
            initiation.user_id,
            initiation.id,
            &initiation.initiation_type,
            message,
            fmt_ts(now),
        ),
    )?;
    Ok(true)
}

/// Attaches a delivery error; the entry stays pending.
pub fn mark_failed(conn: &Connection, initiation_id: i64, error: &str) -> Result<usize> {
    let count = conn.execute(
        "UPDATE initiation_schedule SET error_message = ?1 WHERE id = ?2 AND status = 'pending'",
        (error, initiation_id),
    )?;
    Ok(count)
}

// Outcome logs

pub fn log_for_initiation(conn: &Connection, initiation_id: i64) -> Result<Option<InitiationLogRecord>> {
    let sql = format!("SELECT {LOG_COLUMNS} FROM initiation_logs WHERE initiation_id = ?1");
    let record = conn.query_row(&sql, [initiation_id], log_from_row).optional()?;
    Ok(record)
}

pub fn latest_unanswered_log(
    conn: &Connection,
    user_id: i64,
    since: DateTime<Utc>,
) -> Result<Option<InitiationLogRecord>> {
    let sql = format!(
        "SELECT {LOG_COLUMNS} FROM initiation_logs
         WHERE user_id = ?1 AND user_responded = FALSE AND created_at > ?2
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    let record = conn
        .query_row(&sql, (user_id, fmt_ts(since)), log_from_row)
        .optional()?;
    Ok(record)
}

/// Writes the response outcome onto the initiation's log (creating it if the
/// send was never logged) and flags the schedule entry. A logged response is
/// never overwritten.
pub fn record_response(
    conn: &Connection,
    initiation: &InitiationRecord,
    outcome: &ResponseOutcome<'_>,
) -> Result<()> {
    if initiation.user_response_received {
        return Err(already_answered(initiation.id));
    }
    let stored: String = outcome.response.chars().take(MAX_STORED_RESPONSE_CHARS).collect();
    let length = outcome.response.chars().count() as i64;
    let sent_at = initiation.sent_at.unwrap_or(initiation.scheduled_at);

    let written = conn.execute(
        "INSERT INTO initiation_logs
            (user_id, initiation_id, initiation_type, message_content, created_at, user_responded,
             user_response, user_response_emotion, user_response_sentiment, user_response_length,
             response_time_minutes, responded_at)
         VALUES (?1, ?2, ?3, '', ?4, TRUE, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(initiation_id) DO UPDATE SET
            user_responded = TRUE,
            user_response = excluded.user_response,
            user_response_emotion = excluded.user_response_emotion,
            user_response_sentiment = excluded.user_response_sentiment,
            user_response_length = excluded.user_response_length,
            response_time_minutes = excluded.response_time_minutes,
            responded_at = excluded.responded_at
         WHERE initiation_logs.user_responded = FALSE",
        rusqlite::params![
            initiation.user_id,
            initiation.id,
            initiation.initiation_type,
            fmt_ts(sent_at),
            stored,
            outcome.emotion,
            outcome.sentiment,
            length,
            outcome.response_time_minutes,
            fmt_ts(outcome.responded_at),
        ],
    )?;
    if written == 0 {
        return Err(already_answered(initiation.id));
    }

    conn.execute(
        "UPDATE initiation_schedule SET user_response_received = TRUE WHERE id = ?1",
        [initiation.id],
    )?;
    Ok(())
}

fn already_answered(initiation_id: i64) -> EngineError {
    EngineError::validation(
        "response",
        format!("initiation {} already has a logged response", initiation_id),
    )
}

// Pacing inputs

/// Pending and sent entries scheduled in `[from, to)`.
pub fn count_scheduled_between(
    conn: &Connection,
    user_id: i64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM initiation_schedule
         WHERE user_id = ?1 AND status IN ('pending', 'sent')
           AND scheduled_at >= ?2 AND scheduled_at < ?3",
        (user_id, fmt_ts(from), fmt_ts(to)),
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Latest send time, or planned time for entries not yet sent.
pub fn last_initiation_at(conn: &Connection, user_id: i64) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn.query_row(
        "SELECT MAX(COALESCE(sent_at, scheduled_at)) FROM initiation_schedule
         WHERE user_id = ?1 AND status IN ('pending', 'sent')",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(raw.as_deref().and_then(super::parse_ts))
}

pub fn ignored_count_since(conn: &Connection, user_id: i64, since: DateTime<Utc>) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM initiation_logs
         WHERE user_id = ?1 AND created_at > ?2 AND user_responded = FALSE",
        (user_id, fmt_ts(since)),
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Mean reply length (characters) over replies received after `since`;
/// `None` when there were none.
pub fn avg_response_length_since(conn: &Connection, user_id: i64, since: DateTime<Utc>) -> Result<Option<f64>> {
    let avg = conn.query_row(
        "SELECT AVG(user_response_length) FROM initiation_logs
         WHERE user_id = ?1 AND user_responded = TRUE AND responded_at > ?2
           AND user_response_length IS NOT NULL",
        (user_id, fmt_ts(since)),
        |row| row.get(0),
    )?;
    Ok(avg)
}

// Maintenance

pub fn cancel_stale_pending(conn: &Connection, scheduled_before: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "UPDATE initiation_schedule SET status = 'cancelled'
         WHERE status = 'pending' AND scheduled_at < ?1",
        [fmt_ts(scheduled_before)],
    )?;
    Ok(count)
}

pub fn purge_logs_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "DELETE FROM initiation_logs WHERE created_at < ?1",
        [fmt_ts(cutoff)],
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_settings_defaults_and_pause() {
        let db = test_db();
        let conn = db.lock();
        assert!(get_settings(&conn, 1).unwrap().is_none());

        set_pause(&conn, 1, Some(t0() + Duration::hours(3)), Some("busy"), t0()).unwrap();
        let settings = get_settings(&conn, 1).unwrap().unwrap();
        assert!(!settings.is_enabled);
        assert_eq!(settings.ab_test_group, "A");
        assert_eq!(settings.timezone, "UTC");
        assert!(settings.is_paused(t0()));

        set_enabled(&conn, 1, true, t0()).unwrap();
        let settings = get_settings(&conn, 1).unwrap().unwrap();
        assert!(settings.is_enabled);
        assert!(settings.paused_until.is_none());
    }

    #[test]
    fn test_mark_sent_only_from_pending() {
        let db = test_db();
        let conn = db.lock();
        let id = insert_initiation(&conn, 3, t0(), "continuation", &[4, 9], None, t0()).unwrap();
        let record = get_initiation(&conn, id).unwrap().unwrap();
        assert_eq!(record.source_memory_ids, vec![4, 9]);

        assert!(mark_sent(&conn, &record, "hello again", t0()).unwrap());
        assert!(!mark_sent(&conn, &record, "hello again", t0()).unwrap());

        let log = log_for_initiation(&conn, id).unwrap().unwrap();
        assert_eq!(log.message_content, "hello again");
        assert!(!log.user_responded);
        assert_eq!(mark_failed(&conn, id, "late failure").unwrap(), 0);
    }

    #[test]
    fn test_failed_entries_leave_due_list() {
        let db = test_db();
        let conn = db.lock();
        let a = insert_initiation(&conn, 3, t0() - Duration::minutes(5), "insight", &[], None, t0()).unwrap();
        let b = insert_initiation(&conn, 3, t0() - Duration::minutes(1), "insight", &[], None, t0()).unwrap();
        insert_initiation(&conn, 3, t0() + Duration::hours(1), "insight", &[], None, t0()).unwrap();

        let (due_now, skipped) = due(&conn, t0(), 10).unwrap();
        assert_eq!(due_now.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(skipped, 0);

        mark_failed(&conn, a, "delivery timeout").unwrap();
        let (due_now, _) = due(&conn, t0(), 10).unwrap();
        assert_eq!(due_now.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn test_pacing_inputs() {
        let db = test_db();
        let conn = db.lock();
        let day_start = Utc.with_ymd_and_hms(2026, 5, 4, 0, 0, 0).unwrap();
        let id = insert_initiation(&conn, 3, t0(), "supportive", &[], None, t0()).unwrap();
        insert_initiation(&conn, 3, t0() + Duration::days(1), "supportive", &[], None, t0()).unwrap();

        let count = count_scheduled_between(&conn, 3, day_start, day_start + Duration::days(1)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(last_initiation_at(&conn, 3).unwrap(), Some(t0() + Duration::days(1)));

        let record = get_initiation(&conn, id).unwrap().unwrap();
        mark_sent(&conn, &record, "hi", t0()).unwrap();
        assert_eq!(ignored_count_since(&conn, 3, t0() - Duration::days(7)).unwrap(), 1);
        assert_eq!(cancel_stale_pending(&conn, t0() + Duration::days(2)).unwrap(), 1);
        assert_eq!(last_initiation_at(&conn, 3).unwrap(), Some(t0()));
    }

    #[test]
    fn test_response_is_logged_once() {
        let db = test_db();
        let conn = db.lock();
        let id = insert_initiation(&conn, 3, t0(), "insight", &[], None, t0()).unwrap();
        let record = get_initiation(&conn, id).unwrap().unwrap();
        mark_sent(&conn, &record, "hi", t0()).unwrap();

        let first = ResponseOutcome {
            response: "short",
            emotion: None,
            sentiment: 0.1,
            response_time_minutes: 5,
            responded_at: t0() + Duration::minutes(5),
        };
        let record = get_initiation(&conn, id).unwrap().unwrap();
        record_response(&conn, &record, &first).unwrap();

        let second = ResponseOutcome {
            response: "a much longer second answer",
            responded_at: t0() + Duration::minutes(30),
            ..first
        };
        // Stale record: the upsert guard still refuses
        assert!(matches!(
            record_response(&conn, &record, &second),
            Err(EngineError::Validation { field: "response", .. })
        ));
        let fresh = get_initiation(&conn, id).unwrap().unwrap();
        assert!(record_response(&conn, &fresh, &second).is_err());

        let log = log_for_initiation(&conn, id).unwrap().unwrap();
        assert_eq!(log.user_response.as_deref(), Some("short"));
        assert_eq!(log.user_response_length, Some(5));
        assert_eq!(
            avg_response_length_since(&conn, 3, t0() - Duration::days(7)).unwrap(),
            Some(5.0)
        );
        assert_eq!(avg_response_length_since(&conn, 4, t0() - Duration::days(7)).unwrap(), None);
    }
}
