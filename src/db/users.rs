//! Users, access passwords, the auth audit log, and per-user activity.

use super::{fmt_ts, required_ts, ts_column};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub authorized_until: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub password_used: Option<String>,
    pub last_auth: Option<DateTime<Utc>>,
    pub warned_expiry: bool,
    pub total_messages: i64,
    pub total_ltm_saves: i64,
}

impl UserRecord {
    pub fn is_session_valid(&self, now: DateTime<Utc>) -> bool {
        self.authorized_until.is_some_and(|until| until > now)
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

const USER_COLUMNS: &str = "user_id, username, created_at, authorized_until, failed_attempts, \
     blocked_until, password_used, last_auth, warned_expiry, total_messages, total_ltm_saves";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: row.get(0)?,
        username: row.get(1)?,
        created_at: required_ts(row, 2)?,
        authorized_until: ts_column(row, 3)?,
        failed_attempts: row.get(4)?,
        blocked_until: ts_column(row, 5)?,
        password_used: row.get(6)?,
        last_auth: ts_column(row, 7)?,
        warned_expiry: row.get(8)?,
        total_messages: row.get(9)?,
        total_ltm_saves: row.get(10)?,
    })
}

#[derive(Debug, Clone)]
pub struct PasswordRecord {
    pub password_text: String,
    pub description: Option<String>,
    pub duration_days: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
    pub times_used: i64,
    pub is_active: bool,
}

const PASSWORD_COLUMNS: &str =
    "password_text, description, duration_days, created_at, expires_at, max_uses, times_used, is_active";

fn password_from_row(row: &Row<'_>) -> rusqlite::Result<PasswordRecord> {
    Ok(PasswordRecord {
        password_text: row.get(0)?,
        description: row.get(1)?,
        duration_days: row.get(2)?,
        created_at: required_ts(row, 3)?,
        expires_at: ts_column(row, 4)?,
        max_uses: row.get(5)?,
        times_used: row.get(6)?,
        is_active: row.get(7)?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordStats {
    pub total: i64,
    pub active: i64,
    pub expired: i64,
    pub total_uses: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthLogEntry {
    pub user_id: i64,
    pub action: String,
    pub password_masked: Option<String>,
    pub details: Option<String>,
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub user_id: i64,
    pub total_messages: i64,
    pub first_active: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub avg_daily_messages: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    pub total_users: i64,
    pub authorized_users: i64,
    pub blocked_users: i64,
}

// --- Users ---

pub fn ensure_user(
    conn: &Connection,
    user_id: i64,
    username: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users (user_id, username, created_at) VALUES (?1, ?2, ?3)",
        (user_id, username, fmt_ts(now)),
    )?;
    if let Some(name) = username {
        conn.execute(
            "UPDATE users SET username = ?1 WHERE user_id = ?2 AND username IS NOT ?1",
            (name, user_id),
        )?;
    }
    Ok(())
}

pub fn get_user(conn: &Connection, user_id: i64) -> Result<Option<UserRecord>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1");
    let user = conn
        .query_row(&sql, [user_id], user_from_row)
        .optional()?;
    Ok(user)
}

pub fn record_auth_success(
    conn: &Connection,
    user_id: i64,
    password: &str,
    authorized_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE users SET
            authorized_until = ?1,
            password_used = ?2,
            last_auth = ?3,
            failed_attempts = 0,
            blocked_until = NULL,
            warned_expiry = FALSE,
            expiry_logged = FALSE
         WHERE user_id = ?4",
        (fmt_ts(authorized_until), password, fmt_ts(now), user_id),
    )?;
    Ok(())
}

pub fn set_failed_attempts(
    conn: &Connection,
    user_id: i64,
    attempts: u32,
    blocked_until: Option<DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        "UPDATE users SET failed_attempts = ?1, blocked_until = ?2 WHERE user_id = ?3",
        (attempts, blocked_until.map(fmt_ts), user_id),
    )?;
    Ok(())
}

pub fn clear_block(conn: &Connection, user_id: i64) -> Result<usize> {
    let count = conn.execute(
        "UPDATE users SET blocked_until = NULL, failed_attempts = 0
         WHERE user_id = ?1 AND (blocked_until IS NOT NULL OR failed_attempts > 0)",
        [user_id],
    )?;
    Ok(count)
}

pub fn end_session(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> Result<usize> {
    let count = conn.execute(
        "UPDATE users SET authorized_until = NULL, warned_expiry = FALSE, expiry_logged = TRUE
         WHERE user_id = ?1 AND authorized_until > ?2",
        (user_id, fmt_ts(now)),
    )?;
    Ok(count)
}

pub fn blocked_users(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<UserRecord>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE blocked_until > ?1 ORDER BY blocked_until DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([fmt_ts(now)], user_from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn users_expiring_between(
    conn: &Connection,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<UserRecord>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users
         WHERE authorized_until > ?1 AND authorized_until <= ?2 AND warned_expiry = FALSE
         ORDER BY authorized_until"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map((fmt_ts(now), fmt_ts(until)), user_from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn mark_expiry_warned(conn: &Connection, user_id: i64) -> Result<bool> {
    let count = conn.execute(
        "UPDATE users SET warned_expiry = TRUE WHERE user_id = ?1",
        [user_id],
    )?;
    Ok(count > 0)
}

/// Sessions that lapsed and have not yet been written to the audit log.
pub fn unlogged_lapsed_sessions(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, authorized_until FROM users
         WHERE authorized_until IS NOT NULL AND authorized_until <= ?1 AND expiry_logged = FALSE",
    )?;
    let rows = stmt.query_map([fmt_ts(now)], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn mark_expiry_logged(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE users SET expiry_logged = TRUE, warned_expiry = FALSE WHERE user_id = ?1",
        [user_id],
    )?;
    Ok(())
}

pub fn user_stats(conn: &Connection, now: DateTime<Utc>) -> Result<UserStats> {
    let now = fmt_ts(now);
    let stats = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN authorized_until > ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN blocked_until > ?1 THEN 1 ELSE 0 END), 0)
         FROM users",
        [now],
        |row| {
            Ok(UserStats {
                total_users: row.get(0)?,
                authorized_users: row.get(1)?,
                blocked_users: row.get(2)?,
            })
        },
    )?;
    Ok(stats)
}

// --- Passwords ---

/// Active, unexpired, and under its use cap.
pub fn find_usable_password(
    conn: &Connection,
    password: &str,
    now: DateTime<Utc>,
) -> Result<Option<PasswordRecord>> {
    let sql = format!(
        "SELECT {PASSWORD_COLUMNS} FROM passwords
         WHERE password_text = ?1
           AND is_active = TRUE
           AND (expires_at IS NULL OR expires_at > ?2)
           AND (max_uses IS NULL OR times_used < max_uses)"
    );
    let record = conn
        .query_row(&sql, (password, fmt_ts(now)), password_from_row)
        .optional()?;
    Ok(record)
}

pub fn consume_password(conn: &Connection, password: &str) -> Result<()> {
    conn.execute(
        "UPDATE passwords SET times_used = times_used + 1 WHERE password_text = ?1",
        [password],
    )?;
    Ok(())
}

pub fn password_exists(conn: &Connection, password: &str) -> Result<bool> {
    let exists = conn
        .prepare("SELECT 1 FROM passwords WHERE password_text = ?1")?
        .exists([password])?;
    Ok(exists)
}

pub fn insert_password(conn: &Connection, record: &PasswordRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO passwords (password_text, description, duration_days, created_at, expires_at, max_uses, times_used, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        (
            &record.password_text,
            &record.description,
            record.duration_days,
            fmt_ts(record.created_at),
            record.expires_at.map(fmt_ts),
            record.max_uses,
            record.times_used,
            record.is_active,
        ),
    )?;
    Ok(())
}

pub fn deactivate_password(conn: &Connection, password: &str) -> Result<bool> {
    let count = conn.execute(
        "UPDATE passwords SET is_active = FALSE WHERE password_text = ?1 AND is_active = TRUE",
        [password],
    )?;
    Ok(count > 0)
}

/// Deactivates passwords whose `expires_at` has passed and returns their text.
pub fn deactivate_expired_passwords(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let now = fmt_ts(now);
    let mut stmt = conn.prepare(
        "UPDATE passwords SET is_active = FALSE
         WHERE is_active = TRUE AND expires_at IS NOT NULL AND expires_at <= ?1
         RETURNING password_text",
    )?;
    let rows = stmt.query_map([now], |row| row.get(0))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn list_passwords(conn: &Connection) -> Result<Vec<PasswordRecord>> {
    let sql = format!("SELECT {PASSWORD_COLUMNS} FROM passwords ORDER BY created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], password_from_row)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

pub fn password_stats(conn: &Connection, now: DateTime<Utc>) -> Result<PasswordStats> {
    let stats = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN is_active THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(times_used), 0)
         FROM passwords",
        [fmt_ts(now)],
        |row| {
            Ok(PasswordStats {
                total: row.get(0)?,
                active: row.get(1)?,
                expired: row.get(2)?,
                total_uses: row.get(3)?,
            })
        },
    )?;
    Ok(stats)
}

// --- Audit log ---

pub fn insert_auth_log(
    conn: &Connection,
    user_id: i64,
    action: &str,
    password_masked: Option<&str>,
    details: Option<&str>,
    origin: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO auth_log (user_id, action, password_masked, details, origin, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (user_id, action, password_masked, details, origin, fmt_ts(now)),
    )?;
    Ok(())
}

pub fn auth_log(conn: &Connection, user_id: Option<i64>, limit: usize) -> Result<Vec<AuthLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, action, password_masked, details, origin, created_at
         FROM auth_log
         WHERE ?1 IS NULL OR user_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map((user_id, limit as i64), |row| {
        Ok(AuthLogEntry {
            user_id: row.get(0)?,
            action: row.get(1)?,
            password_masked: row.get(2)?,
            details: row.get(3)?,
            origin: row.get(4)?,
            created_at: required_ts(row, 5)?,
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

// --- Activity ---

/// Counts one inbound message for the user: lifetime counter plus activity
/// stats, with the daily average recomputed over days since first activity.
pub fn record_message(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> Result<ActivityRecord> {
    let now_text = fmt_ts(now);
    conn.execute(
        "UPDATE users SET total_messages = total_messages + 1 WHERE user_id = ?1",
        [user_id],
    )?;
    conn.execute(
        "INSERT INTO activity_stats (user_id, total_messages, first_active, last_active, avg_daily_messages)
         VALUES (?1, 1, ?2, ?2, 1.0)
         ON CONFLICT(user_id) DO UPDATE SET
            total_messages = total_messages + 1,
            last_active = MAX(last_active, ?2)",
        (user_id, &now_text),
    )?;

    let mut activity = get_activity(conn, user_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    let days = (now - activity.first_active).num_days().max(0) + 1;
    activity.avg_daily_messages = activity.total_messages as f64 / days as f64;
    conn.execute(
        "UPDATE activity_stats SET avg_daily_messages = ?1 WHERE user_id = ?2",
        (activity.avg_daily_messages, user_id),
    )?;
    Ok(activity)
}

pub fn get_activity(conn: &Connection, user_id: i64) -> Result<Option<ActivityRecord>> {
    let record = conn
        .query_row(
            "SELECT user_id, total_messages, first_active, last_active, avg_daily_messages
             FROM activity_stats WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(ActivityRecord {
                    user_id: row.get(0)?,
                    total_messages: row.get(1)?,
                    first_active: required_ts(row, 2)?,
                    last_active: required_ts(row, 3)?,
                    avg_daily_messages: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_ensure_user_is_idempotent() {
        let db = test_db();
        let conn = db.lock();
        ensure_user(&conn, 42, None, t0()).unwrap();
        ensure_user(&conn, 42, Some("mira"), t0() + Duration::hours(1)).unwrap();

        let user = get_user(&conn, 42).unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("mira"));
        assert_eq!(user.created_at, t0());
        assert_eq!(user.failed_attempts, 0);
        assert!(!user.is_session_valid(t0()));
    }

    #[test]
    fn test_usable_password_filters() {
        let db = test_db();
        let conn = db.lock();
        let base = PasswordRecord {
            password_text: "open".to_string(),
            description: None,
            duration_days: 7,
            created_at: t0(),
            expires_at: None,
            max_uses: None,
            times_used: 0,
            is_active: true,
        };
        insert_password(&conn, &base).unwrap();
        insert_password(
            &conn,
            &PasswordRecord {
                password_text: "capped".to_string(),
                max_uses: Some(1),
                times_used: 1,
                ..base.clone()
            },
        )
        .unwrap();
        insert_password(
            &conn,
            &PasswordRecord {
                password_text: "stale".to_string(),
                expires_at: Some(t0() - Duration::days(1)),
                ..base.clone()
            },
        )
        .unwrap();

        assert!(find_usable_password(&conn, "open", t0()).unwrap().is_some());
        assert!(find_usable_password(&conn, "OPEN", t0()).unwrap().is_none());
        assert!(find_usable_password(&conn, "capped", t0()).unwrap().is_none());
        assert!(find_usable_password(&conn, "stale", t0()).unwrap().is_none());

        let expired = deactivate_expired_passwords(&conn, t0()).unwrap();
        assert_eq!(expired, vec!["stale".to_string()]);
        let stats = password_stats(&conn, t0()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_record_message_updates_activity() {
        let db = test_db();
        let conn = db.lock();
        ensure_user(&conn, 7, None, t0()).unwrap();

        record_message(&conn, 7, t0()).unwrap();
        record_message(&conn, 7, t0() + Duration::hours(2)).unwrap();
        let activity = record_message(&conn, 7, t0() + Duration::days(2)).unwrap();

        assert_eq!(activity.total_messages, 3);
        assert_eq!(activity.first_active, t0());
        assert_eq!(activity.last_active, t0() + Duration::days(2));
        assert!((activity.avg_daily_messages - 1.0).abs() < f64::EPSILON);

        let user = get_user(&conn, 7).unwrap().unwrap();
        assert_eq!(user.total_messages, 3);
    }

    #[test]
    fn test_auth_log_filters_by_user() {
        let db = test_db();
        let conn = db.lock();
        insert_auth_log(&conn, 1, "password_fail", Some("ab**cd"), None, None, t0()).unwrap();
        insert_auth_log(&conn, 2, "password_success", None, None, Some("10.0.0.2"), t0()).unwrap();

        assert_eq!(auth_log(&conn, None, 10).unwrap().len(), 2);
        let mine = auth_log(&conn, Some(2), 10).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].origin.as_deref(), Some("10.0.0.2"));
    }
}
