pub mod clock;
pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod services;

use chrono::{DateTime, Utc};
use clock::Clock;
use config::ConfigProvider;
use error::Result;
use services::activity::ActivityTracker;
use services::auth::AuthGuard;
use services::memory::MemoryStore;
use services::proactive::ProactivityScheduler;
use services::rate_limit::{QuotaKind, RateLimiter};
use std::sync::Arc;
use tracing::{debug, warn};

/// One inbound user message as resolved by the front end.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub user_id: i64,
    pub username: Option<String>,
    pub text: String,
    pub emotion: Option<String>,
}

/// What the conversation handler gets back when a message is let through.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub authorized_until: DateTime<Utc>,
    pub messages_today: u32,
    /// Initiation this message answered, if any.
    pub answered_initiation: Option<i64>,
}

/// Shared engine state handed to request handlers and background loops.
pub struct Engine {
    pub db: db::Database,
    pub config: Arc<ConfigProvider>,
    pub clock: Arc<dyn Clock>,
    pub auth: AuthGuard,
    pub limiter: RateLimiter,
    pub activity: ActivityTracker,
    pub memory: MemoryStore,
    pub proactive: ProactivityScheduler,
}

impl Engine {
    pub fn new(db: db::Database, config: Arc<ConfigProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            auth: AuthGuard::new(db.clone(), config.clone()),
            limiter: RateLimiter::new(db.clone(), config.clone()),
            activity: ActivityTracker::new(db.clone()),
            memory: MemoryStore::new(db.clone(), config.clone()),
            proactive: ProactivityScheduler::new(db.clone(), config.clone()),
            db,
            config,
            clock,
        }
    }

    pub fn with_expiry_warning(mut self, warn_within: chrono::Duration) -> Self {
        self.auth = self.auth.with_expiry_warning(warn_within);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inbound pipeline: session gate, then the daily Message quota, then
    /// activity bookkeeping. A reply to a recent initiation is logged on the
    /// way through; failing to log it never rejects the message.
    pub async fn admit_message(&self, inbound: &InboundMessage) -> Result<Admission> {
        let now = self.now();
        let user_id = inbound.user_id;

        let authorized_until = self.auth.require_session(user_id, now).await?;
        let messages_today = self
            .limiter
            .try_consume(user_id, QuotaKind::Message, now)
            .await?
            .into_result(QuotaKind::Message)?;
        self.activity
            .record_message(user_id, inbound.username.clone(), now)
            .await?;

        let answered_initiation = match self
            .proactive
            .process_user_response(user_id, &inbound.text, inbound.emotion.as_deref(), now)
            .await
        {
            Ok(log) => log.and_then(|log| log.initiation_id),
            Err(e) => {
                warn!("Engine: failed to log initiation response for user {}: {}", user_id, e);
                None
            }
        };

        debug!("Engine: admitted message {} of today for user {}", messages_today, user_id);
        Ok(Admission {
            authorized_until,
            messages_today,
            answered_initiation,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Tunables;
    use crate::services::auth::NewPassword;
    use chrono::{Duration, TimeZone};

    pub const PASSWORD: &str = "alpha123";

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 12, 0, 0).unwrap()
    }

    /// In-memory engine on a manual clock with one 7-day password.
    pub async fn engine(tunables: Tunables) -> (Engine, ManualClock) {
        let clock = ManualClock::new(t0());
        let engine = Engine::new(
            db::test_db(),
            Arc::new(ConfigProvider::fixed(tunables)),
            Arc::new(clock.clone()),
        );
        engine
            .auth
            .add_password(
                NewPassword {
                    text: PASSWORD.to_string(),
                    description: None,
                    duration_days: 7,
                    expires_at: None,
                    max_uses: None,
                },
                t0() - Duration::days(1),
            )
            .await
            .unwrap();
        (engine, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::Tunables;
    use crate::error::{AuthError, EngineError};

    fn inbound(user_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            user_id,
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admit_requires_session_then_quota() {
        let (engine, _clock) = engine(Tunables {
            daily_message_limit: 2,
            ..Tunables::default()
        })
        .await;

        let err = engine.admit_message(&inbound(1, "hello")).await.unwrap_err();
        assert!(matches!(err, EngineError::Auth(AuthError::SessionExpired)));

        engine.auth.authenticate(1, PASSWORD, None, t0()).await.unwrap();
        assert_eq!(engine.admit_message(&inbound(1, "one")).await.unwrap().messages_today, 1);
        assert_eq!(engine.admit_message(&inbound(1, "two")).await.unwrap().messages_today, 2);

        let err = engine.admit_message(&inbound(1, "three")).await.unwrap_err();
        assert!(err.is_expected_denial());
        assert!(matches!(
            err,
            EngineError::RateLimitExceeded { kind: QuotaKind::Message, limit: 2 }
        ));

        let activity = engine.activity.activity(1).await.unwrap().unwrap();
        assert_eq!(activity.total_messages, 2);
    }

    #[tokio::test]
    async fn test_admit_logs_reply_to_recent_initiation() {
        let (engine, clock) = engine(Tunables::default()).await;
        engine.auth.authenticate(2, PASSWORD, None, t0()).await.unwrap();
        let id = engine
            .proactive
            .schedule(2, t0(), services::proactive::InitiationType::Continuation, vec![], None, t0())
            .await
            .unwrap();
        engine.proactive.mark_sent(id, "how did it go?", t0()).await.unwrap();

        clock.advance(chrono::Duration::minutes(15));
        let admission = engine.admit_message(&inbound(2, "thanks, it went well")).await.unwrap();
        assert_eq!(admission.answered_initiation, Some(id));
    }
}
