use crate::db::users::{self, ActivityRecord, UserStats};
use crate::db::{retry_transient, Database};
use crate::error::Result;
use chrono::{DateTime, Utc};

/// Keeps per-user message counters and activity stats current.
#[derive(Clone)]
pub struct ActivityTracker {
    db: Database,
}

impl ActivityTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ensures the user exists, then bumps the lifetime counter and activity
    /// stats in one transaction.
    pub async fn record_message(
        &self,
        user_id: i64,
        username: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ActivityRecord> {
        retry_transient("ActivityTracker::record_message", || {
            let username = username.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    users::ensure_user(tx, user_id, username.as_deref(), now)?;
                    users::record_message(tx, user_id, now)
                })
            })
        })
        .await
    }

    pub async fn activity(&self, user_id: i64) -> Result<Option<ActivityRecord>> {
        self.db
            .run_blocking(move |db| users::get_activity(&db.lock(), user_id))
            .await
    }

    pub async fn user_stats(&self, now: DateTime<Utc>) -> Result<UserStats> {
        self.db
            .run_blocking(move |db| users::user_stats(&db.lock(), now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_record_message_creates_user_and_averages() {
        let db = test_db();
        let tracker = ActivityTracker::new(db.clone());
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap();

        tracker.record_message(9, Some("mira".to_string()), t0).await.unwrap();
        tracker.record_message(9, None, t0 + Duration::hours(1)).await.unwrap();
        let activity = tracker
            .record_message(9, None, t0 + Duration::days(1))
            .await
            .unwrap();

        assert_eq!(activity.total_messages, 3);
        assert_eq!(activity.last_active, t0 + Duration::days(1));
        assert!((activity.avg_daily_messages - 1.5).abs() < f64::EPSILON);

        let user = users::get_user(&db.lock(), 9).unwrap().unwrap();
        assert_eq!(user.total_messages, 3);
        assert_eq!(user.username.as_deref(), Some("mira"));
    }
}
