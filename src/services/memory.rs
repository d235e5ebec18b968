use crate::config::ConfigProvider;
use crate::db::memories::{self, RETENTION_PROTECTED_IMPORTANCE};
use crate::db::{retry_transient, users, Database, MemoryRecord, MemoryStats, NewMemory};
use crate::error::{AuthError, EngineError, EntityKind, Result};
use crate::services::autosave::{self, SkipReason};
use crate::services::rate_limit::{self, QuotaKind};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records below this importance are never surfaced by search.
pub const MIN_SEARCH_IMPORTANCE: u8 = 5;
pub const DEFAULT_SEARCH_LIMIT: usize = 3;

pub const TYPE_USER_SAVED: &str = "user_saved";
pub const TYPE_AUTO_SAVED: &str = "auto_saved";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    UserMessage,
    BotResponse,
    Tag,
}

impl MatchSource {
    pub fn score(&self) -> f32 {
        match self {
            MatchSource::UserMessage => 1.0,
            MatchSource::BotResponse => 0.8,
            MatchSource::Tag => 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryMatch {
    pub record: MemoryRecord,
    pub source: MatchSource,
    pub score: f32,
}

/// Annotations produced upstream for one exchange.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    pub emotion_primary: Option<String>,
    pub emotion_confidence: Option<f64>,
    pub style_markers: Option<serde_json::Value>,
    pub dialogue_context: Option<String>,
    pub history_id: Option<i64>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSaveOutcome {
    Saved(i64),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Where in the record `query` (already lower-cased) appears, if anywhere.
pub fn match_source(record: &MemoryRecord, query: &str) -> Option<MatchSource> {
    if record.user_message.to_lowercase().contains(query) {
        Some(MatchSource::UserMessage)
    } else if record.bot_response.to_lowercase().contains(query) {
        Some(MatchSource::BotResponse)
    } else if record.contextual_tags.iter().any(|tag| tag.to_lowercase() == query) {
        Some(MatchSource::Tag)
    } else {
        None
    }
}

/// Filters and orders candidates: importance desc, score desc, newest first.
pub fn rank_matches(records: Vec<MemoryRecord>, query: &str, limit: usize) -> Vec<MemoryMatch> {
    let query = query.trim().to_lowercase();
    if query.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut matches: Vec<MemoryMatch> = records
        .into_iter()
        .filter(|record| record.importance_score >= MIN_SEARCH_IMPORTANCE)
        .filter_map(|record| {
            match_source(&record, &query).map(|source| MemoryMatch {
                score: source.score(),
                source,
                record,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.record
            .importance_score
            .cmp(&a.record.importance_score)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| b.record.id.cmp(&a.record.id))
    });
    matches.truncate(limit);
    matches
}

fn validate_importance(importance: u8) -> Result<()> {
    if (1..=10).contains(&importance) {
        Ok(())
    } else {
        Err(EngineError::validation(
            "importance_score",
            format!("{importance} is outside 1-10"),
        ))
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    config: Arc<ConfigProvider>,
}

impl MemoryStore {
    pub fn new(db: Database, config: Arc<ConfigProvider>) -> Self {
        Self { db, config }
    }

    /// Stores an explicitly requested memory. Fails with `QuotaExceeded`
    /// once the user holds `ltm_max_records_per_user` records; nothing is
    /// evicted to make room.
    pub async fn save(&self, mut memory: NewMemory, now: DateTime<Utc>) -> Result<i64> {
        validate_importance(memory.importance)?;
        if memory.user_message.trim().is_empty() && memory.bot_response.trim().is_empty() {
            return Err(EngineError::validation("user_message", "nothing to remember"));
        }
        if memory.memory_type.is_empty() {
            memory.memory_type = TYPE_USER_SAVED.to_string();
        }
        memory.tags = normalize_tags(memory.tags);
        let max_records = self.config.snapshot().ltm_max_records_per_user;

        let memory_id = retry_transient("MemoryStore::save", || {
            let memory = memory.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    users::ensure_user(tx, memory.user_id, None, now)?;
                    if memories::count_for_user(tx, memory.user_id)? >= max_records {
                        return Err(EngineError::QuotaExceeded { max_records });
                    }
                    memories::insert_memory(tx, &memory, now)
                })
            })
        })
        .await?;

        info!("Memory: saved {} for user {}", memory_id, memory.user_id);
        Ok(memory_id)
    }

    /// Saves the exchange if the auto-save policy picks it. The user needs
    /// a live session and a unit of today's AutoSave quota.
    pub async fn auto_save(
        &self,
        user_id: i64,
        user_message: &str,
        bot_response: &str,
        annotations: Annotations,
        now: DateTime<Utc>,
    ) -> Result<AutoSaveOutcome> {
        if let Err(reason) = autosave::evaluate(annotations.emotion_primary.as_deref(), user_message) {
            debug!("Memory: auto-save skipped for user {} ({:?})", user_id, reason);
            return Ok(AutoSaveOutcome::Skipped(reason));
        }

        let tunables = self.config.snapshot();
        let max_records = tunables.ltm_max_records_per_user;
        let daily_limit = QuotaKind::AutoSave.limit(&tunables);

        let mut tags = autosave::extract_contextual_tags(user_message, bot_response);
        if let Some(emotion) = annotations.emotion_primary.as_deref() {
            tags.push(format!("emotion_{}", emotion.trim().to_lowercase()));
        }
        let memory = NewMemory {
            user_id,
            user_message: user_message.to_string(),
            bot_response: bot_response.to_string(),
            dialogue_context: annotations.dialogue_context,
            importance: tunables.auto_save_importance,
            memory_type: TYPE_AUTO_SAVED.to_string(),
            tags: normalize_tags(tags),
            style_markers: annotations.style_markers,
            emotion_primary: annotations.emotion_primary,
            emotion_confidence: annotations.emotion_confidence,
            history_id: annotations.history_id,
            session_id: annotations.session_id,
        };

        let result = retry_transient("MemoryStore::auto_save", || {
            let memory = memory.clone();
            self.db.run_blocking(move |db| {
                db.transaction(|tx| {
                    let user = users::get_user(tx, user_id)?;
                    match user {
                        Some(user) if user.is_session_valid(now) && !user.is_blocked(now) => {}
                        _ => return Err(AuthError::SessionExpired.into()),
                    }
                    if memories::count_for_user(tx, user_id)? >= max_records {
                        return Err(EngineError::QuotaExceeded { max_records });
                    }
                    rate_limit::consume_on(tx, user_id, QuotaKind::AutoSave, daily_limit, now)?
                        .into_result(QuotaKind::AutoSave)?;
                    memories::insert_memory(tx, &memory, now)
                })
            })
        })
        .await;

        match result {
            Ok(memory_id) => {
                info!("Memory: auto-saved {} for user {}", memory_id, user_id);
                Ok(AutoSaveOutcome::Saved(memory_id))
            }
            Err(e) => {
                if e.is_expected_denial() {
                    debug!("Memory: auto-save denied for user {}: {}", user_id, e);
                }
                Err(e)
            }
        }
    }

    /// Read-only: callers decide which results to `touch`.
    pub async fn search(&self, user_id: i64, query: &str, limit: usize) -> Result<Vec<MemoryMatch>> {
        let (records, skipped) = self
            .db
            .run_blocking(move |db| memories::search_candidates(&db.lock(), user_id, MIN_SEARCH_IMPORTANCE))
            .await?;
        if skipped > 0 {
            warn!("Memory: skipped {} undecodable records for user {}", skipped, user_id);
        }
        Ok(rank_matches(records, query, limit))
    }

    pub async fn touch(&self, memory_id: i64, now: DateTime<Utc>) -> Result<()> {
        let touched = self.touch_many(vec![memory_id], now).await?;
        if touched == 0 {
            return Err(EngineError::not_found(EntityKind::Memory, memory_id));
        }
        Ok(())
    }

    pub async fn touch_many(&self, memory_ids: Vec<i64>, now: DateTime<Utc>) -> Result<usize> {
        if memory_ids.is_empty() {
            return Ok(0);
        }
        retry_transient("MemoryStore::touch", || {
            let ids = memory_ids.clone();
            self.db
                .run_blocking(move |db| db.transaction(|tx| memories::touch(tx, &ids, now)))
        })
        .await
    }

    pub async fn rate(&self, memory_id: i64, importance: u8) -> Result<()> {
        validate_importance(importance)?;
        let updated = self
            .db
            .run_blocking(move |db| memories::set_importance(&db.lock(), memory_id, importance))
            .await?;
        if updated == 0 {
            return Err(EngineError::not_found(EntityKind::Memory, memory_id));
        }
        Ok(())
    }

    /// Deletes only within the owner's records.
    pub async fn delete(&self, user_id: i64, memory_id: i64) -> Result<()> {
        let deleted = self
            .db
            .run_blocking(move |db| memories::delete_memory(&db.lock(), user_id, memory_id))
            .await?;
        if deleted == 0 {
            return Err(EngineError::not_found(EntityKind::Memory, memory_id));
        }
        info!("Memory: user {} deleted memory {}", user_id, memory_id);
        Ok(())
    }

    pub async fn get(&self, memory_id: i64) -> Result<MemoryRecord> {
        self.db
            .run_blocking(move |db| memories::get_memory(&db.lock(), memory_id))
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::Memory, memory_id))
    }

    pub async fn recent(&self, user_id: i64, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.db
            .run_blocking(move |db| memories::recent(&db.lock(), user_id, limit))
            .await
    }

    pub async fn stats(&self, user_id: i64) -> Result<MemoryStats> {
        self.db
            .run_blocking(move |db| memories::stats(&db.lock(), user_id))
            .await
    }

    pub async fn memory_count_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<u32> {
        self.db
            .run_blocking(move |db| memories::count_since(&db.lock(), user_id, since))
            .await
    }

    /// Highest-importance memories created since `since`.
    pub async fn top_since(&self, user_id: i64, since: DateTime<Utc>, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.db
            .run_blocking(move |db| memories::top_since(&db.lock(), user_id, since, limit))
            .await
    }

    /// Retention sweep. Deletes records older than `retention_days` that
    /// were not accessed within half that window and have importance below
    /// 7. Candidates come from one snapshot; each deletion is its own
    /// transaction that re-checks the predicate, so the store is never held
    /// across the batch. Running it twice deletes nothing new.
    pub async fn cleanup(&self, retention_days: u32, now: DateTime<Utc>) -> Result<CleanupReport> {
        let out_of_range = || EngineError::validation("retention_days", "out of range");
        let created_before = now
            .checked_sub_signed(Duration::days(i64::from(retention_days)))
            .ok_or_else(out_of_range)?;
        let accessed_before = now
            .checked_sub_signed(Duration::hours(i64::from(retention_days) * 12))
            .ok_or_else(out_of_range)?;

        let candidates = self
            .db
            .run_blocking(move |db| memories::retention_candidates(&db.lock(), created_before, accessed_before))
            .await?;

        let mut report = CleanupReport {
            candidates: candidates.len(),
            ..CleanupReport::default()
        };
        for memory_id in candidates {
            let result = retry_transient("MemoryStore::cleanup", || {
                self.db.run_blocking(move |db| {
                    memories::delete_if_expired(&db.lock(), memory_id, created_before, accessed_before)
                })
            })
            .await;
            match result {
                Ok(n) => report.deleted += n,
                Err(e) => {
                    warn!("Memory: failed to delete {} during cleanup: {}", memory_id, e);
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(
                "Memory: cleanup removed {} of {} candidates ({} failed, importance >= {} kept)",
                report.deleted, report.candidates, report.failed, RETENTION_PROTECTED_IMPORTANCE
            );
        }
        Ok(report)
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::db::test_db;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    fn store_with(tunables: Tunables) -> MemoryStore {
        MemoryStore::new(test_db(), Arc::new(ConfigProvider::fixed(tunables)))
    }

    fn memory(user_id: i64, user_message: &str, bot_response: &str, importance: u8) -> NewMemory {
        NewMemory {
            user_id,
            user_message: user_message.to_string(),
            bot_response: bot_response.to_string(),
            importance,
            ..Default::default()
        }
    }

    fn authorize(store: &MemoryStore, user_id: i64, until: DateTime<Utc>) {
        let conn = store.db.lock();
        users::ensure_user(&conn, user_id, None, t0()).unwrap();
        users::record_auth_success(&conn, user_id, "pw", until, t0()).unwrap();
    }

    #[tokio::test]
    async fn test_search_dragons_cap_filter_and_order() {
        let store = store_with(Tunables::default());
        let low = store.save(memory(1, "dragons everywhere", "indeed", 4), t0()).await.unwrap();
        let bot_only = store
            .save(memory(1, "tell me a story", "once there were Dragons", 6), t0())
            .await
            .unwrap();
        let user_hit = store
            .save(memory(1, "I dream of DRAGONS", "they dream of you", 6), t0() - Duration::days(1))
            .await
            .unwrap();
        let top = store.save(memory(1, "dragons again", "sure", 9), t0()).await.unwrap();
        let tag_only = store
            .save(
                NewMemory {
                    tags: vec!["Dragons".to_string()],
                    ..memory(1, "winged things", "scaly friends", 5)
                },
                t0(),
            )
            .await
            .unwrap();
        store.save(memory(2, "dragons for another user", "x", 9), t0()).await.unwrap();

        let results = store.search(1, "dragons", 3).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|m| m.record.importance_score >= 5));
        assert_eq!(
            results.iter().map(|m| m.record.id).collect::<Vec<_>>(),
            vec![top, user_hit, bot_only]
        );
        assert_eq!(results[1].source, MatchSource::UserMessage);
        assert_eq!(results[2].score, 0.8);

        let all = store.search(1, "dragons", 10).await.unwrap();
        assert_eq!(all.last().map(|m| m.record.id), Some(tag_only));
        assert!(all.iter().all(|m| m.record.id != low));

        // Search never bumps access stats
        assert_eq!(store.get(top).await.unwrap().access_count, 0);
    }

    #[tokio::test]
    async fn test_save_fails_at_record_cap_without_eviction() {
        let store = store_with(Tunables {
            ltm_max_records_per_user: 2,
            ..Tunables::default()
        });
        store.save(memory(1, "one", "a", 5), t0()).await.unwrap();
        store.save(memory(1, "two", "b", 5), t0()).await.unwrap();

        let err = store.save(memory(1, "three", "c", 5), t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { max_records: 2 }));
        assert_eq!(store.stats(1).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_importance_validation() {
        let store = store_with(Tunables::default());
        let err = store.save(memory(1, "x y z", "a", 11), t0()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "importance_score", .. }));

        let id = store.save(memory(1, "x y z", "a", 5), t0()).await.unwrap();
        assert!(store.rate(id, 0).await.is_err());
        store.rate(id, 8).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().importance_score, 8);
        assert!(matches!(
            store.rate(999, 5).await,
            Err(EngineError::NotFound { kind: EntityKind::Memory, .. })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_never_deletes_important_or_recent() {
        let store = store_with(Tunables::default());
        let old = t0() - Duration::days(400);
        let stale = store.save(memory(1, "old note", "a", 6), old).await.unwrap();
        let important = store.save(memory(1, "old vow", "b", 7), old).await.unwrap();
        let accessed = store.save(memory(1, "old but used", "c", 3), old).await.unwrap();
        let fresh = store.save(memory(1, "new note", "d", 1), t0()).await.unwrap();
        store.touch(accessed, t0() - Duration::days(30)).await.unwrap();

        let report = store.cleanup(365, t0()).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);
        assert!(store.get(stale).await.is_err());
        for id in [important, accessed, fresh] {
            assert!(store.get(id).await.is_ok());
        }

        // Idempotent
        assert_eq!(store.cleanup(365, t0()).await.unwrap().deleted, 0);

        // A window reaching past the calendar is refused, not applied
        assert!(matches!(
            store.cleanup(u32::MAX, t0()).await,
            Err(EngineError::Validation { field: "retention_days", .. })
        ));
        assert!(store.get(fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_auto_save_requires_session_and_quota() {
        let store = store_with(Tunables {
            max_auto_saves_per_day: 1,
            auto_save_importance: 6,
            ..Tunables::default()
        });
        let annotations = Annotations {
            emotion_primary: Some("joy".to_string()),
            ..Annotations::default()
        };

        let err = store
            .auto_save(1, "the library at night", "lamps everywhere", annotations.clone(), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Auth(AuthError::SessionExpired)));

        authorize(&store, 1, t0() + Duration::days(7));
        let outcome = store
            .auto_save(1, "the library at night", "lamps everywhere", annotations.clone(), t0())
            .await
            .unwrap();
        let AutoSaveOutcome::Saved(id) = outcome else {
            panic!("expected a save, got {outcome:?}");
        };
        let record = store.get(id).await.unwrap();
        assert_eq!(record.memory_type, TYPE_AUTO_SAVED);
        assert_eq!(record.importance_score, 6);
        assert_eq!(record.contextual_tags, vec!["emotion_joy", "lamp", "library"]);

        let err = store
            .auto_save(1, "the square at dawn", "quiet", annotations.clone(), t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimitExceeded { kind: QuotaKind::AutoSave, limit: 1 }
        ));

        let skipped = store.auto_save(1, "ok", "fine", annotations, t0()).await.unwrap();
        assert_eq!(skipped, AutoSaveOutcome::Skipped(SkipReason::Excluded));
    }

    #[tokio::test]
    async fn test_delete_is_scoped_to_owner() {
        let store = store_with(Tunables::default());
        let id = store.save(memory(1, "mine", "a", 5), t0()).await.unwrap();
        assert!(store.delete(2, id).await.is_err());
        store.delete(1, id).await.unwrap();
        assert!(store.recent(1, 10).await.unwrap().is_empty());
    }
}
