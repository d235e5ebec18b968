use crate::config::{ConfigProvider, MAX_RETENTION_DAYS};
use crate::db::users::{self, UserStats};
use crate::db::{retry_transient, AuthLogEntry, Database, PasswordRecord, PasswordStats, UserRecord};
use crate::error::{AuthError, EngineError, EntityKind, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one password submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized { authorized_until: DateTime<Utc> },
    InvalidPassword { remaining_attempts: u32 },
    Locked { remaining: std::time::Duration },
}

impl AuthOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthOutcome::Authorized { .. })
    }

    pub fn into_result(self) -> std::result::Result<DateTime<Utc>, AuthError> {
        match self {
            AuthOutcome::Authorized { authorized_until } => Ok(authorized_until),
            AuthOutcome::InvalidPassword { remaining_attempts } => {
                Err(AuthError::InvalidPassword { remaining_attempts })
            }
            AuthOutcome::Locked { remaining } => Err(AuthError::Locked { remaining }),
        }
    }
}

/// Computed from stored timestamps and `now`; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Authorized {
        until: DateTime<Utc>,
        expiring_soon: bool,
    },
    Blocked {
        remaining: std::time::Duration,
    },
    Unauthorized,
}

impl AuthStatus {
    pub fn of(user: &UserRecord, now: DateTime<Utc>, warn_within: Duration) -> Self {
        if let Some(blocked_until) = user.blocked_until.filter(|until| *until > now) {
            return AuthStatus::Blocked {
                remaining: remaining(blocked_until, now),
            };
        }
        match user.authorized_until.filter(|until| *until > now) {
            Some(until) => AuthStatus::Authorized {
                until,
                expiring_soon: until - now <= warn_within,
            },
            None => AuthStatus::Unauthorized,
        }
    }
}

/// Audit actions written to `auth_log`.
pub mod action {
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const FAILED_ATTEMPT: &str = "failed_attempt";
    pub const BLOCKED: &str = "blocked";
    pub const BLOCKED_ATTEMPT: &str = "blocked_attempt";
    pub const MANUAL_LOGOUT: &str = "manual_logout";
    pub const UNBLOCKED: &str = "unblocked";
    pub const AUTO_EXPIRED: &str = "auto_expired";
}

/// `te***23`; four characters or fewer are fully starred.
pub fn mask_password(password: &str) -> String {
    let chars: Vec<char> = password.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (until - now).to_std().unwrap_or_default()
}

/// A new shared-secret password for the pool.
#[derive(Debug, Clone)]
pub struct NewPassword {
    pub text: String,
    pub description: Option<String>,
    pub duration_days: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i64>,
}

#[derive(Clone)]
pub struct AuthGuard {
    db: Database,
    config: Arc<ConfigProvider>,
    expiry_warning: Duration,
}

impl AuthGuard {
    pub fn new(db: Database, config: Arc<ConfigProvider>) -> Self {
        Self {
            db,
            config,
            expiry_warning: Duration::days(3),
        }
    }

    pub fn with_expiry_warning(mut self, warn_within: Duration) -> Self {
        self.expiry_warning = warn_within;
        self
    }

    /// Checks a submitted password. The whole decision runs in one
    /// transaction so concurrent failures for the same user all count.
    ///
    /// While a lockout is active nothing is counted or extended. Once it has
    /// elapsed the attempt counter starts again from zero.
    pub async fn authenticate(
        &self,
        user_id: i64,
        submitted: &str,
        origin: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AuthOutcome> {
        let tunables = self.config.snapshot();
        let max_attempts = tunables.max_password_attempts.max(1);
        let lockout = tunables.lockout_duration();
        let submitted = submitted.trim().to_string();
        let origin = origin.map(str::to_string);

        let outcome = retry_transient("AuthGuard::authenticate", || {
            let submitted = submitted.clone();
            let origin = origin.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    users::ensure_user(tx, user_id, None, now)?;
                    let user = users::get_user(tx, user_id)?
                        .ok_or_else(|| EngineError::not_found(EntityKind::User, user_id))?;
                    let masked = mask_password(&submitted);
                    let origin = origin.as_deref();

                    if let Some(blocked_until) = user.blocked_until.filter(|until| *until > now) {
                        users::insert_auth_log(
                            tx,
                            user_id,
                            action::BLOCKED_ATTEMPT,
                            Some(&masked),
                            None,
                            origin,
                            now,
                        )?;
                        return Ok(AuthOutcome::Locked {
                            remaining: remaining(blocked_until, now),
                        });
                    }

                    // A lockout that has run out starts a fresh count
                    let prior_attempts = if user.blocked_until.is_some() {
                        0
                    } else {
                        user.failed_attempts
                    };

                    if let Some(password) = users::find_usable_password(tx, &submitted, now)? {
                        let authorized_until = Duration::try_days(password.duration_days)
                            .and_then(|length| now.checked_add_signed(length))
                            .ok_or_else(|| EngineError::validation("duration_days", "out of range"))?;
                        users::record_auth_success(tx, user_id, &submitted, authorized_until, now)?;
                        users::consume_password(tx, &submitted)?;
                        let details = format!("valid until {}", crate::db::fmt_ts(authorized_until));
                        users::insert_auth_log(
                            tx,
                            user_id,
                            action::LOGIN_SUCCESS,
                            Some(&masked),
                            Some(&details),
                            origin,
                            now,
                        )?;
                        return Ok(AuthOutcome::Authorized { authorized_until });
                    }

                    let attempts = prior_attempts + 1;
                    if attempts >= max_attempts {
                        let blocked_until = now
                            .checked_add_signed(lockout)
                            .ok_or_else(|| EngineError::validation("bruteforce_timeout_seconds", "out of range"))?;
                        users::set_failed_attempts(tx, user_id, attempts, Some(blocked_until))?;
                        let details = format!("{attempts} failed attempts");
                        users::insert_auth_log(
                            tx,
                            user_id,
                            action::BLOCKED,
                            Some(&masked),
                            Some(&details),
                            origin,
                            now,
                        )?;
                        Ok(AuthOutcome::Locked {
                            remaining: remaining(blocked_until, now),
                        })
                    } else {
                        users::set_failed_attempts(tx, user_id, attempts, None)?;
                        users::insert_auth_log(
                            tx,
                            user_id,
                            action::FAILED_ATTEMPT,
                            Some(&masked),
                            None,
                            origin,
                            now,
                        )?;
                        Ok(AuthOutcome::InvalidPassword {
                            remaining_attempts: max_attempts - attempts,
                        })
                    }
                })
            })
        })
        .await?;

        match &outcome {
            AuthOutcome::Authorized { authorized_until } => {
                info!("Auth: user {} authorized until {}", user_id, authorized_until)
            }
            AuthOutcome::InvalidPassword { remaining_attempts } => debug!(
                "Auth: user {} submitted an invalid password ({} attempts left)",
                user_id, remaining_attempts
            ),
            AuthOutcome::Locked { remaining } => {
                info!("Auth: user {} locked for {}s", user_id, remaining.as_secs())
            }
        }
        Ok(outcome)
    }

    pub async fn status(&self, user_id: i64, now: DateTime<Utc>) -> Result<AuthStatus> {
        let warn_within = self.expiry_warning;
        let user = self
            .db
            .run_blocking(move |db| users::get_user(&db.lock(), user_id))
            .await?;
        Ok(match user {
            Some(user) => AuthStatus::of(&user, now, warn_within),
            None => AuthStatus::Unauthorized,
        })
    }

    pub async fn is_session_valid(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        Ok(matches!(self.status(user_id, now).await?, AuthStatus::Authorized { .. }))
    }

    /// Gate used by every other component.
    pub async fn require_session(&self, user_id: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.status(user_id, now).await? {
            AuthStatus::Authorized { until, .. } => Ok(until),
            AuthStatus::Blocked { remaining } => Err(AuthError::Locked { remaining }.into()),
            AuthStatus::Unauthorized => Err(AuthError::SessionExpired.into()),
        }
    }

    /// Whether a password prompt issued at `prompted_at` has gone stale.
    pub fn prompt_expired(&self, prompted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - prompted_at > self.config.snapshot().auth_prompt_timeout()
    }

    /// Ends the session immediately. Returns false if there was none.
    pub async fn logout(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let ended = self
            .db
            .run_blocking(move |db| {
                db.transaction(|tx| {
                    let ended = users::end_session(tx, user_id, now)? > 0;
                    if ended {
                        users::insert_auth_log(tx, user_id, action::MANUAL_LOGOUT, None, None, None, now)?;
                    }
                    Ok(ended)
                })
            })
            .await?;
        if ended {
            info!("Auth: user {} logged out", user_id);
        }
        Ok(ended)
    }

    /// Operator override: clears the lockout and the attempt counter.
    pub async fn unblock(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let cleared = self
            .db
            .run_blocking(move |db| {
                db.transaction(|tx| {
                    let cleared = users::clear_block(tx, user_id)? > 0;
                    if cleared {
                        users::insert_auth_log(tx, user_id, action::UNBLOCKED, None, None, None, now)?;
                    }
                    Ok(cleared)
                })
            })
            .await?;
        if cleared {
            info!("Auth: user {} unblocked", user_id);
        }
        Ok(cleared)
    }

    pub async fn blocked_users(&self, now: DateTime<Utc>) -> Result<Vec<UserRecord>> {
        self.db
            .run_blocking(move |db| users::blocked_users(&db.lock(), now))
            .await
    }

    pub async fn auth_log(&self, user_id: Option<i64>, limit: usize) -> Result<Vec<AuthLogEntry>> {
        self.db
            .run_blocking(move |db| users::auth_log(&db.lock(), user_id, limit))
            .await
    }

    pub async fn user_stats(&self, now: DateTime<Utc>) -> Result<UserStats> {
        self.db
            .run_blocking(move |db| users::user_stats(&db.lock(), now))
            .await
    }

    // --- Password pool ---

    pub async fn add_password(&self, new: NewPassword, now: DateTime<Utc>) -> Result<()> {
        let text = new.text.trim().to_string();
        if text.is_empty() {
            return Err(EngineError::validation("password_text", "must not be empty"));
        }
        if !(1..=i64::from(MAX_RETENTION_DAYS)).contains(&new.duration_days) {
            return Err(EngineError::validation(
                "duration_days",
                format!("must be between 1 and {MAX_RETENTION_DAYS}"),
            ));
        }
        if new.max_uses.is_some_and(|uses| uses <= 0) {
            return Err(EngineError::validation("max_uses", "must be positive when set"));
        }

        let record = PasswordRecord {
            password_text: text,
            description: new.description,
            duration_days: new.duration_days,
            created_at: now,
            expires_at: new.expires_at,
            max_uses: new.max_uses,
            times_used: 0,
            is_active: true,
        };
        let masked = mask_password(&record.password_text);

        self.db
            .run_blocking(move |db| {
                db.transaction(|tx| {
                    if users::password_exists(tx, &record.password_text)? {
                        return Err(EngineError::validation("password_text", "already exists"));
                    }
                    users::insert_password(tx, &record)
                })
            })
            .await?;
        info!("Auth: added password {}", masked);
        Ok(())
    }

    pub async fn deactivate_password(&self, text: &str) -> Result<()> {
        let text = text.trim().to_string();
        let masked = mask_password(&text);
        let deactivated = self
            .db
            .run_blocking(move |db| users::deactivate_password(&db.lock(), &text))
            .await?;
        if !deactivated {
            return Err(EngineError::not_found(EntityKind::Password, masked));
        }
        info!("Auth: deactivated password {}", masked);
        Ok(())
    }

    /// Deactivates every password whose `expires_at` has passed.
    pub async fn deactivate_expired_passwords(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = retry_transient("AuthGuard::deactivate_expired_passwords", || {
            self.db
                .run_blocking(move |db| users::deactivate_expired_passwords(&db.lock(), now))
        })
        .await?;
        for text in &expired {
            info!("Auth: password {} expired", mask_password(text));
        }
        Ok(expired.len())
    }

    /// Masked unless `show_full` is set.
    pub async fn list_passwords(&self, show_full: bool) -> Result<Vec<PasswordRecord>> {
        let mut records = self
            .db
            .run_blocking(|db| users::list_passwords(&db.lock()))
            .await?;
        if !show_full {
            for record in &mut records {
                record.password_text = mask_password(&record.password_text);
            }
        }
        Ok(records)
    }

    pub async fn password_stats(&self, now: DateTime<Utc>) -> Result<PasswordStats> {
        self.db
            .run_blocking(move |db| users::password_stats(&db.lock(), now))
            .await
    }

    // --- Expiry bookkeeping ---

    /// Live sessions ending within `warn_within` that have not been warned yet.
    pub async fn users_needing_expiry_warning(
        &self,
        now: DateTime<Utc>,
        warn_within: Duration,
    ) -> Result<Vec<UserRecord>> {
        self.db
            .run_blocking(move |db| users::users_expiring_between(&db.lock(), now, now + warn_within))
            .await
    }

    pub async fn mark_expiry_warned(&self, user_id: i64) -> Result<bool> {
        self.db
            .run_blocking(move |db| users::mark_expiry_warned(&db.lock(), user_id))
            .await
    }

    /// Writes one `auto_expired` audit entry per session that lapsed since
    /// the last sweep. Status is computed either way; this only records the
    /// event. Rows that fail are skipped and counted.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let lapsed = self
            .db
            .run_blocking(move |db| users::unlogged_lapsed_sessions(&db.lock(), now))
            .await?;

        let mut logged = 0;
        let mut failed = 0;
        for (user_id, until) in lapsed {
            let result = retry_transient("AuthGuard::expire_sessions", || {
                let details = format!("session ended at {until}");
                self.db.run_blocking(move |db| {
                    db.transaction(|tx| {
                        users::insert_auth_log(
                            tx,
                            user_id,
                            action::AUTO_EXPIRED,
                            None,
                            Some(&details),
                            None,
                            now,
                        )?;
                        users::mark_expiry_logged(tx, user_id)
                    })
                })
            })
            .await;
            match result {
                Ok(()) => logged += 1,
                Err(e) => {
                    warn!("Auth: failed to record expiry for user {}: {}", user_id, e);
                    failed += 1;
                }
            }
        }
        if logged > 0 {
            info!("Auth: recorded {} expired sessions", logged);
        }
        Ok((logged, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::db::test_db;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap()
    }

    async fn guard_with(tunables: Tunables) -> AuthGuard {
        let guard = AuthGuard::new(test_db(), Arc::new(ConfigProvider::fixed(tunables)));
        guard
            .add_password(
                NewPassword {
                    text: "alpha123".to_string(),
                    description: Some("weekly pass".to_string()),
                    duration_days: 7,
                    expires_at: None,
                    max_uses: None,
                },
                t0() - Duration::days(1),
            )
            .await
            .unwrap();
        guard
    }

    #[tokio::test]
    async fn test_alpha123_session_lapses_after_duration() {
        let guard = guard_with(Tunables::default()).await;

        let outcome = guard.authenticate(1, "alpha123", Some("10.0.0.7"), t0()).await.unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Authorized {
                authorized_until: t0() + Duration::days(7)
            }
        );
        assert!(guard.is_session_valid(1, t0() + Duration::days(6)).await.unwrap());
        assert!(!guard.is_session_valid(1, t0() + Duration::days(8)).await.unwrap());
        assert!(matches!(
            guard.require_session(1, t0() + Duration::days(8)).await,
            Err(EngineError::Auth(AuthError::SessionExpired))
        ));

        let log = guard.auth_log(Some(1), 10).await.unwrap();
        assert_eq!(log[0].action, action::LOGIN_SUCCESS);
        assert_eq!(log[0].password_masked.as_deref(), Some("al***23"));
        assert_eq!(log[0].origin.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_lockout_after_max_attempts_even_with_correct_password() {
        let guard = guard_with(Tunables {
            max_password_attempts: 3,
            bruteforce_timeout_seconds: 900,
            ..Tunables::default()
        })
        .await;

        assert_eq!(
            guard.authenticate(2, "wrong", None, t0()).await.unwrap(),
            AuthOutcome::InvalidPassword { remaining_attempts: 2 }
        );
        assert_eq!(
            guard.authenticate(2, "wrong", None, t0()).await.unwrap(),
            AuthOutcome::InvalidPassword { remaining_attempts: 1 }
        );
        assert_eq!(
            guard.authenticate(2, "wrong", None, t0()).await.unwrap(),
            AuthOutcome::Locked {
                remaining: std::time::Duration::from_secs(900)
            }
        );

        let later = t0() + Duration::seconds(300);
        assert_eq!(
            guard.authenticate(2, "alpha123", None, later).await.unwrap(),
            AuthOutcome::Locked {
                remaining: std::time::Duration::from_secs(600)
            }
        );
        assert!(matches!(
            guard.status(2, later).await.unwrap(),
            AuthStatus::Blocked { .. }
        ));

        // No extension while locked, and access returns once it elapses
        let after = t0() + Duration::seconds(901);
        assert!(guard.authenticate(2, "alpha123", None, after).await.unwrap().is_authorized());
    }

    #[tokio::test]
    async fn test_oversized_timeouts_never_break_authentication() {
        // Rejected on load: the default lockout applies
        let guard = guard_with(Tunables::from_pairs([
            ("bruteforce_timeout_seconds", "10000000000000000"),
            ("max_password_attempts", "1"),
        ]))
        .await;
        assert_eq!(
            guard.authenticate(1, "wrong", None, t0()).await.unwrap(),
            AuthOutcome::Locked {
                remaining: std::time::Duration::from_secs(900)
            }
        );

        // Set directly: clamped to the maximum timeout
        let guard = guard_with(Tunables {
            bruteforce_timeout_seconds: u64::MAX,
            max_password_attempts: 1,
            ..Tunables::default()
        })
        .await;
        assert_eq!(
            guard.authenticate(1, "wrong", None, t0()).await.unwrap(),
            AuthOutcome::Locked {
                remaining: std::time::Duration::from_secs(crate::config::MAX_TIMEOUT_SECONDS)
            }
        );

        let huge = guard
            .add_password(
                NewPassword {
                    text: "forever".to_string(),
                    description: None,
                    duration_days: 1_000_000_000,
                    expires_at: None,
                    max_uses: None,
                },
                t0(),
            )
            .await;
        assert!(matches!(huge, Err(EngineError::Validation { field: "duration_days", .. })));
    }

    #[tokio::test]
    async fn test_elapsed_lockout_restarts_attempt_count() {
        let guard = guard_with(Tunables {
            max_password_attempts: 2,
            ..Tunables::default()
        })
        .await;
        guard.authenticate(3, "nope", None, t0()).await.unwrap();
        guard.authenticate(3, "nope", None, t0()).await.unwrap();

        let after = t0() + Duration::hours(1);
        assert_eq!(
            guard.authenticate(3, "nope", None, after).await.unwrap(),
            AuthOutcome::InvalidPassword { remaining_attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_failures_all_count() {
        let guard = guard_with(Tunables {
            max_password_attempts: 50,
            ..Tunables::default()
        })
        .await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.authenticate(4, "bad", None, t0()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let user = users::get_user(&guard.db.lock(), 4).unwrap().unwrap();
        assert_eq!(user.failed_attempts, 8);
    }

    #[tokio::test]
    async fn test_password_caps_and_expiry() {
        let guard = guard_with(Tunables::default()).await;
        guard
            .add_password(
                NewPassword {
                    text: "single-use".to_string(),
                    description: None,
                    duration_days: 1,
                    expires_at: Some(t0() + Duration::days(2)),
                    max_uses: Some(1),
                },
                t0(),
            )
            .await
            .unwrap();

        assert!(guard.authenticate(5, "single-use", None, t0()).await.unwrap().is_authorized());
        assert!(!guard.authenticate(6, "single-use", None, t0()).await.unwrap().is_authorized());

        let dup = guard
            .add_password(
                NewPassword {
                    text: "alpha123".to_string(),
                    description: None,
                    duration_days: 1,
                    expires_at: None,
                    max_uses: None,
                },
                t0(),
            )
            .await;
        assert!(matches!(dup, Err(EngineError::Validation { field: "password_text", .. })));

        assert_eq!(guard.deactivate_expired_passwords(t0() + Duration::days(3)).await.unwrap(), 1);
        let listed = guard.list_passwords(false).await.unwrap();
        assert!(listed.iter().all(|p| p.password_text.contains("***")));
    }

    #[tokio::test]
    async fn test_logout_unblock_and_expiry_audit() {
        let guard = guard_with(Tunables {
            max_password_attempts: 1,
            ..Tunables::default()
        })
        .await;

        guard.authenticate(7, "alpha123", None, t0()).await.unwrap();
        assert!(guard.logout(7, t0() + Duration::hours(1)).await.unwrap());
        assert!(!guard.logout(7, t0() + Duration::hours(2)).await.unwrap());
        assert_eq!(guard.status(7, t0() + Duration::hours(2)).await.unwrap(), AuthStatus::Unauthorized);

        guard.authenticate(8, "wrong", None, t0()).await.unwrap();
        assert_eq!(guard.blocked_users(t0()).await.unwrap().len(), 1);
        assert!(guard.unblock(8, t0()).await.unwrap());
        assert!(guard.blocked_users(t0()).await.unwrap().is_empty());

        guard.authenticate(9, "alpha123", None, t0()).await.unwrap();
        let warn = guard
            .users_needing_expiry_warning(t0() + Duration::days(5), Duration::days(3))
            .await
            .unwrap();
        assert_eq!(warn.iter().map(|u| u.user_id).collect::<Vec<_>>(), vec![9]);

        let (logged, failed) = guard.expire_sessions(t0() + Duration::days(8)).await.unwrap();
        assert_eq!((logged, failed), (1, 0));
        // Already recorded; a second sweep is a no-op
        assert_eq!(guard.expire_sessions(t0() + Duration::days(9)).await.unwrap(), (0, 0));
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(mask_password("test123"), "te***23");
        assert_eq!(mask_password("abcd"), "****");
        assert_eq!(mask_password(""), "");
    }
}
