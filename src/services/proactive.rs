use crate::config::{ConfigProvider, Tunables};
use crate::db::initiations::{self, ResponseOutcome, STATUS_CANCELLED, STATUS_PENDING, STATUS_SENT};
use crate::db::{
    retry_transient, Database, InitiationLogRecord, InitiationRecord, MemoryRecord, ProactivitySettings,
    ReadyUserRow,
};
use crate::error::{EngineError, EntityKind, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Users active more recently than this are left alone.
pub const MIN_SILENCE_HOURS: i64 = 6;
/// Users silent for longer than this have drifted away.
pub const MAX_SILENCE_DAYS: i64 = 7;
pub const MEMORY_WINDOW_DAYS: i64 = 30;
pub const RESPONSE_WINDOW_HOURS: i64 = 24;
pub const SILENCE_WINDOW_DAYS: i64 = 7;
pub const SILENCE_AFTER_IGNORED: u32 = 2;
/// Average reply length (characters) below which a user is left alone.
pub const SILENCE_MIN_RESPONSE_LENGTH: f64 = 10.0;
/// Longest pause a user can request.
pub const MAX_PAUSE_DAYS: i64 = 365;

const NEGATIVE_EMOTIONS: &[&str] = &["sadness", "anger", "fear", "disgust"];
const POSITIVE_REPLY_WORDS: &[&str] = &[
    "thanks",
    "thank you",
    "interesting",
    "great",
    "awesome",
    "yes",
    "of course",
    "sure",
    "nice",
];
const NEGATIVE_REPLY_WORDS: &[&str] = &[
    "no",
    "don't",
    "leave me",
    "tired",
    "busy",
    "later",
    "not interested",
    "boring",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitiationType {
    /// Picks up a thread from a recent conversation.
    Continuation,
    /// Connects two memories that share a theme.
    Insight,
    /// Checks in after a run of difficult emotions.
    Supportive,
}

impl InitiationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiationType::Continuation => "continuation",
            InitiationType::Insight => "insight",
            InitiationType::Supportive => "supportive",
        }
    }

    /// Opening line handed to the front end. The conversation model may
    /// rewrite it; the engine only needs something deliverable.
    pub fn opening(&self, topic: Option<&str>) -> String {
        match (self, topic) {
            (InitiationType::Continuation, Some(topic)) => {
                format!("I keep coming back to what you said about \"{topic}\". How did it turn out?")
            }
            (InitiationType::Insight, Some(topic)) => {
                format!("Something connected for me while thinking about \"{topic}\". Want to hear it?")
            }
            (InitiationType::Supportive, Some(topic)) => {
                format!("I've been thinking about \"{topic}\". How are you holding up?")
            }
            (InitiationType::Supportive, None) => "Just checking in. How are you holding up?".to_string(),
            (_, None) => "It's been a while. What's on your mind lately?".to_string(),
        }
    }
}

impl fmt::Display for InitiationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitiationType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "continuation" => Ok(InitiationType::Continuation),
            "insight" => Ok(InitiationType::Insight),
            "supportive" => Ok(InitiationType::Supportive),
            other => Err(EngineError::validation(
                "initiation_type",
                format!("unknown type '{other}'"),
            )),
        }
    }
}

/// Where an initiation stands. Non-response is inferred, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum InitiationState {
    Pending,
    /// Delivery failed; still pending until re-driven or cancelled.
    FailedPending { error: String },
    Sent { sent_at: DateTime<Utc> },
    Responded { sent_at: DateTime<Utc> },
    Cancelled,
}

impl InitiationState {
    pub fn of(record: &InitiationRecord) -> Self {
        match record.status.as_str() {
            STATUS_PENDING => match &record.error_message {
                Some(error) => InitiationState::FailedPending { error: error.clone() },
                None => InitiationState::Pending,
            },
            STATUS_SENT => {
                let sent_at = record.sent_at.unwrap_or(record.scheduled_at);
                if record.user_response_received {
                    InitiationState::Responded { sent_at }
                } else {
                    InitiationState::Sent { sent_at }
                }
            }
            _ => InitiationState::Cancelled,
        }
    }
}

/// An eligibility candidate: passes every precondition, not yet paced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyUser {
    pub user_id: i64,
    pub memory_count_30d: u32,
    pub hours_since_active: i64,
    pub timezone: String,
    pub ab_test_group: String,
}

impl ReadyUser {
    fn from_row(row: ReadyUserRow, now: DateTime<Utc>) -> Self {
        Self {
            user_id: row.user_id,
            memory_count_30d: row.memory_count_30d,
            hours_since_active: (now - row.last_active).num_hours(),
            timezone: row.timezone,
            ab_test_group: row.ab_test_group,
        }
    }
}

/// Recent initiation history a pacing policy decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacingHistory {
    pub scheduled_today: u32,
    pub last_initiation_at: Option<DateTime<Utc>>,
    pub ignored_recently: u32,
    /// Mean length of replies over the silence window, if any arrived.
    pub avg_response_length_recent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacingVeto {
    DailyCap { max_per_day: u32 },
    TooSoon { next_allowed: DateTime<Utc> },
    Silenced { ignored: u32 },
    ShortReplies { avg_length: f64 },
}

/// Decides whether a candidate may receive another initiation. Evaluated by
/// the caller before `schedule`; the scheduler itself never paces.
pub trait PacingPolicy: Send + Sync {
    fn check(&self, history: &PacingHistory, now: DateTime<Utc>) -> std::result::Result<(), PacingVeto>;
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalPacing {
    pub min_interval: Duration,
    pub max_per_day: u32,
    pub silence_after_ignored: u32,
    pub min_response_length: f64,
}

impl IntervalPacing {
    pub fn from_tunables(tunables: &Tunables) -> Self {
        Self {
            min_interval: Duration::hours(tunables.proactive_min_interval_hours as i64),
            max_per_day: tunables.proactive_max_per_day,
            silence_after_ignored: SILENCE_AFTER_IGNORED,
            min_response_length: SILENCE_MIN_RESPONSE_LENGTH,
        }
    }
}

impl PacingPolicy for IntervalPacing {
    fn check(&self, history: &PacingHistory, now: DateTime<Utc>) -> std::result::Result<(), PacingVeto> {
        if history.scheduled_today >= self.max_per_day {
            return Err(PacingVeto::DailyCap {
                max_per_day: self.max_per_day,
            });
        }
        if let Some(last) = history.last_initiation_at {
            let next_allowed = last
                .checked_add_signed(self.min_interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < next_allowed {
                return Err(PacingVeto::TooSoon { next_allowed });
            }
        }
        if history.ignored_recently >= self.silence_after_ignored {
            return Err(PacingVeto::Silenced {
                ignored: history.ignored_recently,
            });
        }
        if let Some(avg_length) = history.avg_response_length_recent {
            if avg_length < self.min_response_length {
                return Err(PacingVeto::ShortReplies { avg_length });
            }
        }
        Ok(())
    }
}

/// Emotion base weighted 0.7, reply keywords 0.3, clamped to [-1, 1].
pub fn response_sentiment(message: &str, emotion: Option<&str>) -> f64 {
    let base = match emotion.map(|e| e.trim().to_lowercase()).as_deref() {
        Some("joy") => 0.8,
        Some("love") => 0.9,
        Some("surprise") => 0.6,
        Some("sadness") => -0.6,
        Some("anger") => -0.8,
        Some("fear") => -0.7,
        Some("disgust") => -0.9,
        _ => 0.0,
    };

    let lowered = message.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();
    let contains = |phrase: &str| {
        if phrase.contains(' ') {
            lowered.contains(phrase)
        } else {
            words.contains(&phrase)
        }
    };
    let positive = POSITIVE_REPLY_WORDS.iter().filter(|w| contains(w)).count() as f64;
    let negative = NEGATIVE_REPLY_WORDS.iter().filter(|w| contains(w)).count() as f64;
    let text = (positive - negative) * 0.2;

    (base * 0.7 + text * 0.3).clamp(-1.0, 1.0)
}

pub fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!("Proactive: unrecognised timezone '{}', falling back to UTC", name);
        chrono_tz::UTC
    })
}

/// Earliest instant at or after `now` that falls inside the `[start, end)`
/// local hours in `timezone`. A window with `start > end` wraps past
/// midnight (`(22, 6)` is 22:00 to 06:00); `start == end` is always open.
pub fn next_send_time(now: DateTime<Utc>, timezone: &str, active_hours: (u32, u32)) -> DateTime<Utc> {
    let tz = parse_timezone(timezone);
    let (start, end) = active_hours;
    let local = now.with_timezone(&tz);
    let hour = local.hour();
    let open = match start.cmp(&end) {
        std::cmp::Ordering::Less => (start..end).contains(&hour),
        std::cmp::Ordering::Greater => hour >= start || hour < end,
        std::cmp::Ordering::Equal => true,
    };
    if open {
        return now;
    }

    // Next opening is today's `start` unless it has passed.
    let mut day = local.date_naive();
    if hour >= start {
        day = day.succ_opt().unwrap_or(day);
    }
    let opening = day.and_time(NaiveTime::from_hms_opt(start, 0, 0).unwrap_or(NaiveTime::MIN));
    tz.from_local_datetime(&opening)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(opening + Duration::hours(1))).earliest())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Supportive when recent memories skew negative, insight when two of them
/// share a topic tag, continuation otherwise.
pub fn choose_initiation_type(memories: &[MemoryRecord]) -> InitiationType {
    let negative = memories
        .iter()
        .filter(|m| {
            m.emotion_primary
                .as_deref()
                .is_some_and(|e| NEGATIVE_EMOTIONS.contains(&e.to_lowercase().as_str()))
        })
        .count();
    if negative > 0 && negative * 2 >= memories.len() {
        return InitiationType::Supportive;
    }

    let shares_topic = memories.iter().enumerate().any(|(i, a)| {
        memories[i + 1..].iter().any(|b| {
            a.contextual_tags
                .iter()
                .filter(|tag| !tag.starts_with("emotion_"))
                .any(|tag| b.contextual_tags.contains(tag))
        })
    });
    if shares_topic {
        InitiationType::Insight
    } else {
        InitiationType::Continuation
    }
}

/// Short topic phrase lifted from a memory's user message.
pub fn topic_of(memory: &MemoryRecord) -> String {
    const MAX_TOPIC_CHARS: usize = 60;
    let text = memory.user_message.trim();
    if text.chars().count() <= MAX_TOPIC_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_TOPIC_CHARS).collect();
    match cut.rfind(' ') {
        Some(idx) if idx > 0 => format!("{}...", &cut[..idx]),
        _ => format!("{cut}..."),
    }
}

#[derive(Clone)]
pub struct ProactivityScheduler {
    db: Database,
    config: Arc<ConfigProvider>,
}

impl ProactivityScheduler {
    pub fn new(db: Database, config: Arc<ConfigProvider>) -> Self {
        Self { db, config }
    }

    // --- Settings ---

    /// Stored settings, or the defaults for a user who never changed them.
    pub async fn settings(&self, user_id: i64, now: DateTime<Utc>) -> Result<ProactivitySettings> {
        let stored = self
            .db
            .run_blocking(move |db| initiations::get_settings(&db.lock(), user_id))
            .await?;
        Ok(stored.unwrap_or_else(|| ProactivitySettings {
            user_id,
            is_enabled: false,
            paused_until: None,
            pause_reason: None,
            ab_test_group: "A".to_string(),
            timezone: "UTC".to_string(),
            updated_at: now,
        }))
    }

    pub async fn enable(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.db
            .run_blocking(move |db| initiations::set_enabled(&db.lock(), user_id, true, now))
            .await?;
        info!("Proactive: enabled for user {}", user_id);
        Ok(())
    }

    pub async fn disable(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.db
            .run_blocking(move |db| initiations::set_enabled(&db.lock(), user_id, false, now))
            .await?;
        info!("Proactive: disabled for user {}", user_id);
        Ok(())
    }

    /// Pauses for a human duration such as `3h` or `1d 12h`.
    pub async fn pause(
        &self,
        user_id: i64,
        duration: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let parsed = humantime::parse_duration(duration.trim())
            .map_err(|e| EngineError::validation("duration", e.to_string()))?;
        let length = Duration::from_std(parsed)
            .map_err(|e| EngineError::validation("duration", e.to_string()))?;
        if length <= Duration::zero() {
            return Err(EngineError::validation("duration", "must be positive"));
        }
        if length > Duration::days(MAX_PAUSE_DAYS) {
            return Err(EngineError::validation(
                "duration",
                format!("at most {MAX_PAUSE_DAYS} days"),
            ));
        }
        let until = now
            .checked_add_signed(length)
            .ok_or_else(|| EngineError::validation("duration", "too far in the future"))?;
        let reason = reason.map(str::to_string);

        self.db
            .run_blocking(move |db| {
                initiations::set_pause(&db.lock(), user_id, Some(until), reason.as_deref(), now)
            })
            .await?;
        info!("Proactive: user {} paused until {}", user_id, until);
        Ok(until)
    }

    pub async fn resume(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.db
            .run_blocking(move |db| initiations::set_pause(&db.lock(), user_id, None, None, now))
            .await
    }

    pub async fn set_timezone(&self, user_id: i64, timezone: &str, now: DateTime<Utc>) -> Result<()> {
        let tz: Tz = timezone
            .trim()
            .parse()
            .map_err(|_| EngineError::validation("timezone", format!("unknown timezone '{timezone}'")))?;
        let name = tz.name().to_string();
        self.db
            .run_blocking(move |db| initiations::set_timezone(&db.lock(), user_id, &name, now))
            .await
    }

    // --- Eligibility ---

    /// Candidates only: enabled, unpaused, silent for 6h to 7d, with a live
    /// session. Ordered by 30-day memory count, then longest silence.
    pub async fn find_ready_users(&self, now: DateTime<Utc>) -> Result<Vec<ReadyUser>> {
        if !self.config.snapshot().proactive_enabled_globally {
            debug!("Proactive: disabled globally, no candidates");
            return Ok(Vec::new());
        }

        let (rows, skipped) = self
            .db
            .run_blocking(move |db| {
                initiations::ready_users(
                    &db.lock(),
                    now,
                    now - Duration::days(MAX_SILENCE_DAYS),
                    now - Duration::hours(MIN_SILENCE_HOURS),
                    now - Duration::days(MEMORY_WINDOW_DAYS),
                )
            })
            .await?;
        if skipped > 0 {
            warn!("Proactive: skipped {} malformed candidate rows", skipped);
        }
        Ok(rows.into_iter().map(|row| ReadyUser::from_row(row, now)).collect())
    }

    /// Inputs for a `PacingPolicy` decision about this user.
    pub async fn pacing_history(&self, user_id: i64, now: DateTime<Utc>) -> Result<PacingHistory> {
        self.db
            .run_blocking(move |db| {
                let conn = db.lock();
                let day_start = now
                    .date_naive()
                    .and_time(NaiveTime::MIN)
                    .and_utc();
                let window_start = now - Duration::days(SILENCE_WINDOW_DAYS);
                Ok(PacingHistory {
                    scheduled_today: initiations::count_scheduled_between(
                        &conn,
                        user_id,
                        day_start,
                        day_start + Duration::days(1),
                    )?,
                    last_initiation_at: initiations::last_initiation_at(&conn, user_id)?,
                    ignored_recently: initiations::ignored_count_since(&conn, user_id, window_start)?,
                    avg_response_length_recent: initiations::avg_response_length_since(
                        &conn,
                        user_id,
                        window_start,
                    )?,
                })
            })
            .await
    }

    // --- Lifecycle ---

    /// Creates a pending entry. Pacing is the caller's job.
    pub async fn schedule(
        &self,
        user_id: i64,
        when: DateTime<Utc>,
        initiation_type: InitiationType,
        source_memory_ids: Vec<i64>,
        emotion_context: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = retry_transient("ProactivityScheduler::schedule", || {
            let ids = source_memory_ids.clone();
            let emotion = emotion_context.clone();
            self.db.run_blocking(move |db| {
                initiations::insert_initiation(
                    &db.lock(),
                    user_id,
                    when,
                    initiation_type.as_str(),
                    &ids,
                    emotion.as_deref(),
                    now,
                )
            })
        })
        .await?;
        info!("Proactive: scheduled {} initiation {} for user {} at {}", initiation_type, id, user_id, when);
        Ok(id)
    }

    pub async fn initiation(&self, initiation_id: i64) -> Result<InitiationRecord> {
        self.db
            .run_blocking(move |db| initiations::get_initiation(&db.lock(), initiation_id))
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::Initiation, initiation_id))
    }

    pub async fn state(&self, initiation_id: i64) -> Result<InitiationState> {
        Ok(InitiationState::of(&self.initiation(initiation_id).await?))
    }

    pub async fn due_initiations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<InitiationRecord>> {
        let (records, skipped) = self
            .db
            .run_blocking(move |db| initiations::due(&db.lock(), now, limit))
            .await?;
        if skipped > 0 {
            warn!("Proactive: skipped {} malformed due initiations", skipped);
        }
        Ok(records)
    }

    /// `Pending -> Sent`, opening the outcome log with the delivered text.
    pub async fn mark_sent(&self, initiation_id: i64, message: &str, now: DateTime<Utc>) -> Result<()> {
        let message = message.to_string();
        retry_transient("ProactivityScheduler::mark_sent", || {
            let message = message.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    let record = initiations::get_initiation(tx, initiation_id)?
                        .ok_or_else(|| EngineError::not_found(EntityKind::Initiation, initiation_id))?;
                    if !initiations::mark_sent(tx, &record, &message, now)? {
                        return Err(EngineError::validation(
                            "status",
                            format!("initiation {} is {}, not pending", initiation_id, record.status),
                        ));
                    }
                    Ok(())
                })
            })
        })
        .await?;
        debug!("Proactive: initiation {} sent", initiation_id);
        Ok(())
    }

    /// Attaches the error; the entry stays pending. Re-driving is a fresh
    /// `schedule` call.
    pub async fn mark_failed(&self, initiation_id: i64, error: &str) -> Result<()> {
        let error = error.to_string();
        let logged = error.clone();
        retry_transient("ProactivityScheduler::mark_failed", || {
            let error = error.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    let record = initiations::get_initiation(tx, initiation_id)?
                        .ok_or_else(|| EngineError::not_found(EntityKind::Initiation, initiation_id))?;
                    if initiations::mark_failed(tx, initiation_id, &error)? == 0 {
                        return Err(EngineError::validation(
                            "status",
                            format!("initiation {} is {}, not pending", initiation_id, record.status),
                        ));
                    }
                    Ok(())
                })
            })
        })
        .await?;
        warn!("Proactive: initiation {} failed: {}", initiation_id, logged);
        Ok(())
    }

    /// Records the user's reply to a sent initiation.
    pub async fn log_response(
        &self,
        initiation_id: i64,
        response: &str,
        emotion: Option<&str>,
        sentiment: f64,
        responded_at: DateTime<Utc>,
    ) -> Result<InitiationLogRecord> {
        let response = response.to_string();
        let emotion = emotion.map(str::to_string);
        let sentiment = sentiment.clamp(-1.0, 1.0);

        retry_transient("ProactivityScheduler::log_response", || {
            let response = response.clone();
            let emotion = emotion.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    let record = initiations::get_initiation(tx, initiation_id)?
                        .ok_or_else(|| EngineError::not_found(EntityKind::Initiation, initiation_id))?;
                    let sent_at = match (record.status.as_str(), record.sent_at) {
                        (STATUS_SENT, Some(sent_at)) => sent_at,
                        _ => {
                            return Err(EngineError::validation(
                                "status",
                                format!("initiation {} was never sent", initiation_id),
                            ))
                        }
                    };
                    let outcome = ResponseOutcome {
                        response: &response,
                        emotion: emotion.as_deref(),
                        sentiment,
                        response_time_minutes: (responded_at - sent_at).num_minutes().max(0),
                        responded_at,
                    };
                    initiations::record_response(tx, &record, &outcome)?;
                    initiations::log_for_initiation(tx, initiation_id)?
                        .ok_or_else(|| EngineError::not_found(EntityKind::Initiation, initiation_id))
                })
            })
        })
        .await
    }

    /// Treats an inbound message as the answer to the user's latest
    /// unanswered initiation from the past 24h, if there is one.
    pub async fn process_user_response(
        &self,
        user_id: i64,
        message: &str,
        emotion: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<InitiationLogRecord>> {
        let since = now - Duration::hours(RESPONSE_WINDOW_HOURS);
        let open = self
            .db
            .run_blocking(move |db| initiations::latest_unanswered_log(&db.lock(), user_id, since))
            .await?;
        let Some(initiation_id) = open.and_then(|log| log.initiation_id) else {
            return Ok(None);
        };

        let sentiment = response_sentiment(message, emotion);
        let log = self
            .log_response(initiation_id, message, emotion, sentiment, now)
            .await?;
        info!(
            "Proactive: user {} answered initiation {} after {} min (sentiment {:.2})",
            user_id,
            initiation_id,
            log.response_time_minutes.unwrap_or_default(),
            sentiment
        );
        Ok(Some(log))
    }

    // --- Maintenance ---

    /// Cancels pending entries scheduled more than `max_age` ago.
    pub async fn cancel_stale_pending(&self, now: DateTime<Utc>, max_age: Duration) -> Result<usize> {
        let cancelled = retry_transient("ProactivityScheduler::cancel_stale_pending", || {
            self.db
                .run_blocking(move |db| initiations::cancel_stale_pending(&db.lock(), now - max_age))
        })
        .await?;
        if cancelled > 0 {
            info!("Proactive: marked {} stale initiations {}", cancelled, STATUS_CANCELLED);
        }
        Ok(cancelled)
    }

    pub async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        retry_transient("ProactivityScheduler::purge_logs_before", || {
            self.db
                .run_blocking(move |db| initiations::purge_logs_before(&db.lock(), cutoff))
        })
        .await
    }
}
