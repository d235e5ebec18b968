use crate::config::{ConfigProvider, Tunables};
use crate::db::{limits, retry_transient, Database, QuotaUsage};
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Counted action kinds, each with its own daily limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Message,
    AutoSave,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::Message => "message",
            QuotaKind::AutoSave => "auto_save",
        }
    }

    pub fn limit(&self, tunables: &Tunables) -> u32 {
        match self {
            QuotaKind::Message => tunables.daily_message_limit,
            QuotaKind::AutoSave => tunables.max_auto_saves_per_day,
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: u32 },
    Denied { limit: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn into_result(self, kind: QuotaKind) -> Result<u32> {
        match self {
            RateDecision::Allowed { count } => Ok(count),
            RateDecision::Denied { limit } => Err(EngineError::RateLimitExceeded { kind, limit }),
        }
    }
}

/// The quota window is the UTC calendar date.
pub fn quota_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Consumes one unit on an open connection, for callers that need the quota
/// check inside their own transaction.
pub fn consume_on(
    conn: &Connection,
    user_id: i64,
    kind: QuotaKind,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<RateDecision> {
    let decision = match limits::try_increment(conn, user_id, quota_day(now), kind.as_str(), limit, now)? {
        Some(count) => RateDecision::Allowed { count },
        None => RateDecision::Denied { limit },
    };
    if !decision.is_allowed() {
        debug!("RateLimiter: user {} hit daily {} limit ({})", user_id, kind, limit);
    }
    Ok(decision)
}

#[derive(Clone)]
pub struct RateLimiter {
    db: Database,
    config: Arc<ConfigProvider>,
}

impl RateLimiter {
    pub fn new(db: Database, config: Arc<ConfigProvider>) -> Self {
        Self { db, config }
    }

    /// Takes one unit of today's quota if any is left. Denials do not touch
    /// the counter and consumed units are never refunded.
    pub async fn try_consume(&self, user_id: i64, kind: QuotaKind, now: DateTime<Utc>) -> Result<RateDecision> {
        let limit = kind.limit(&self.config.snapshot());
        retry_transient("RateLimiter::try_consume", || {
            self.db.run_blocking(move |db| {
                let conn = db.lock();
                consume_on(&conn, user_id, kind, limit, now)
            })
        })
        .await
    }

    pub async fn usage(&self, user_id: i64, kind: QuotaKind, now: DateTime<Utc>) -> Result<QuotaUsage> {
        let limit = kind.limit(&self.config.snapshot());
        let count = self
            .db
            .run_blocking(move |db| {
                let conn = db.lock();
                limits::current_count(&conn, user_id, quota_day(now), kind.as_str())
            })
            .await?;
        Ok(QuotaUsage::new(count, limit))
    }

    /// Drops counter rows for days before `cutoff`.
    pub async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize> {
        retry_transient("RateLimiter::purge_before", || {
            self.db.run_blocking(move |db| {
                let conn = db.lock();
                limits::purge_before(&conn, cutoff)
            })
        })
        .await
    }
}
