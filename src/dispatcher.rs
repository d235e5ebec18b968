use crate::config::Config;
use crate::db::InitiationRecord;
use crate::delivery::Delivery;
use crate::services::proactive::{
    choose_initiation_type, next_send_time, topic_of, InitiationType, IntervalPacing, PacingPolicy, ReadyUser,
};
use crate::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Source memories considered when planning one initiation.
const SOURCE_MEMORY_LIMIT: usize = 3;
const SOURCE_MEMORY_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub planning_interval: Duration,
    pub sender_interval: Duration,
    pub maintenance_interval: Duration,
    pub config_reload_interval: Duration,
    pub batch_size: usize,
    pub active_hours: (u32, u32),
    pub counter_retention_days: i64,
    pub log_retention: ChronoDuration,
    pub stale_pending: ChronoDuration,
    pub expiry_warning: ChronoDuration,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            planning_interval: Duration::from_secs(config.planning_interval_secs.max(1)),
            sender_interval: Duration::from_secs(config.sender_interval_secs.max(1)),
            maintenance_interval: Duration::from_secs(config.maintenance_interval_secs.max(1)),
            config_reload_interval: Duration::from_secs(config.config_reload_interval_secs.max(1)),
            batch_size: config.sender_batch_size.max(1),
            active_hours: config.active_hours(),
            counter_retention_days: config.counter_retention_days,
            log_retention: ChronoDuration::days(config.initiation_log_retention_days),
            stale_pending: ChronoDuration::hours(config.stale_pending_hours),
            expiry_warning: ChronoDuration::days(config.expiry_warning_days),
        }
    }
}

/// Per-pass tally. Row failures are counted, never propagated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub memories_deleted: usize,
    pub counters_purged: usize,
    pub passwords_expired: usize,
    pub sessions_expired: usize,
    pub expiry_warnings: usize,
    pub initiations_cancelled: usize,
    pub logs_purged: usize,
    pub failures: usize,
}

/// Owns the background loops: planning, sending, maintenance.
pub struct Dispatcher {
    engine: Arc<Engine>,
    delivery: Arc<dyn Delivery>,
    pacing: Option<Arc<dyn PacingPolicy>>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, delivery: Arc<dyn Delivery>, settings: DispatcherSettings) -> Self {
        Self {
            engine,
            delivery,
            pacing: None,
            settings,
        }
    }

    /// Replaces the default interval pacing built from current tunables.
    pub fn with_pacing(mut self, pacing: Arc<dyn PacingPolicy>) -> Self {
        self.pacing = Some(pacing);
        self
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_planning(shutdown.clone())),
            tokio::spawn(self.clone().run_sending(shutdown.clone())),
            tokio::spawn(self.run_maintenance(shutdown)),
        ]
    }

    async fn run_planning(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.planning_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.plan_pass().await {
                        Ok(report) if report.processed > 0 || report.failed > 0 => {
                            info!("Planner: scheduled {}, vetoed {}, failed {}", report.processed, report.skipped, report.failed)
                        }
                        Ok(_) => debug!("Planner: nothing to schedule"),
                        Err(e) => error!("Planner pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Planner: stopped");
    }

    async fn run_sending(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.sender_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.send_pass().await {
                        Ok(report) if report.processed > 0 || report.failed > 0 => {
                            info!("Sender: delivered {}, failed {}", report.processed, report.failed)
                        }
                        Ok(_) => debug!("Sender: nothing due"),
                        Err(e) => error!("Sender pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Sender: stopped");
    }

    /// Sweeps on the maintenance interval and reloads tunables on their own,
    /// shorter interval.
    async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = interval(self.settings.maintenance_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reload = interval(self.settings.config_reload_interval);
        reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = reload.tick() => {
                    if let Err(e) = self.engine.config.reload(&self.engine.db).await {
                        warn!("Config reload failed, keeping previous tunables: {}", e);
                    }
                }
                _ = sweep.tick() => {
                    let report = self.maintenance_pass().await;
                    info!("Maintenance: {:?}", report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Maintenance: stopped");
    }

    /// Scan, pace, pick source memories, schedule. Safe to re-run after a
    /// cancelled pass: pending entries count toward pacing.
    pub async fn plan_pass(&self) -> anyhow::Result<PassReport> {
        let now = self.engine.now();
        let pacing: Arc<dyn PacingPolicy> = match &self.pacing {
            Some(pacing) => pacing.clone(),
            None => Arc::new(IntervalPacing::from_tunables(&self.engine.config.snapshot())),
        };

        let candidates = self.engine.proactive.find_ready_users(now).await?;
        let mut report = PassReport::default();
        for candidate in candidates {
            match self.plan_user(&candidate, pacing.as_ref(), now).await {
                Ok(Some(_)) => report.processed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!("Planner: failed for user {}: {}", candidate.user_id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn plan_user(
        &self,
        candidate: &ReadyUser,
        pacing: &dyn PacingPolicy,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<i64>> {
        let user_id = candidate.user_id;
        let history = self.engine.proactive.pacing_history(user_id, now).await?;
        if let Err(veto) = pacing.check(&history, now) {
            debug!("Planner: user {} vetoed: {:?}", user_id, veto);
            return Ok(None);
        }

        let sources = self
            .engine
            .memory
            .top_since(user_id, now - ChronoDuration::days(SOURCE_MEMORY_DAYS), SOURCE_MEMORY_LIMIT)
            .await?;
        if sources.is_empty() {
            debug!("Planner: user {} has no recent memories to draw on", user_id);
            return Ok(None);
        }

        let initiation_type = choose_initiation_type(&sources);
        let emotion_context = sources.iter().find_map(|m| m.emotion_primary.clone());
        let when = next_send_time(now, &candidate.timezone, self.settings.active_hours);
        let source_ids = sources.iter().map(|m| m.id).collect();

        let id = self
            .engine
            .proactive
            .schedule(user_id, when, initiation_type, source_ids, emotion_context, now)
            .await?;
        Ok(Some(id))
    }

    /// Delivers due initiations. A failed delivery leaves the entry pending
    /// with its error attached.
    pub async fn send_pass(&self) -> anyhow::Result<PassReport> {
        let now = self.engine.now();
        let due = self
            .engine
            .proactive
            .due_initiations(now, self.settings.batch_size)
            .await?;

        let mut report = PassReport::default();
        for initiation in due {
            match self.send_one(&initiation, now).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!("Sender: initiation {} failed: {}", initiation.id, e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn send_one(&self, initiation: &InitiationRecord, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let proactive = &self.engine.proactive;
        let user_id = initiation.user_id;

        let settings = proactive.settings(user_id, now).await?;
        let session_valid = self.engine.auth.is_session_valid(user_id, now).await?;
        if !settings.is_enabled || settings.is_paused(now) || !session_valid {
            proactive
                .mark_failed(initiation.id, "recipient no longer eligible")
                .await?;
            return Ok(false);
        }

        let content = self.compose(initiation).await;
        match self.delivery.deliver(user_id, &content).await {
            Ok(()) => {
                proactive.mark_sent(initiation.id, &content, now).await?;
                Ok(true)
            }
            Err(e) => {
                proactive.mark_failed(initiation.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn compose(&self, initiation: &InitiationRecord) -> String {
        let initiation_type = initiation
            .initiation_type
            .parse()
            .unwrap_or(InitiationType::Continuation);
        let topic = match initiation.source_memory_ids.first() {
            Some(id) => self.engine.memory.get(*id).await.ok().map(|m| topic_of(&m)),
            None => None,
        };
        initiation_type.opening(topic.as_deref())
    }

    /// Every step runs even if an earlier one fails.
    pub async fn maintenance_pass(&self) -> MaintenanceReport {
        let now = self.engine.now();
        let tunables = self.engine.config.snapshot();
        let mut report = MaintenanceReport::default();

        match self.engine.memory.cleanup(tunables.ltm_auto_cleanup_days, now).await {
            Ok(cleanup) => {
                report.memories_deleted = cleanup.deleted;
                report.failures += cleanup.failed;
            }
            Err(e) => {
                warn!("Maintenance: memory cleanup failed: {}", e);
                report.failures += 1;
            }
        }

        let counter_cutoff = now.date_naive() - ChronoDuration::days(self.settings.counter_retention_days);
        match self.engine.limiter.purge_before(counter_cutoff).await {
            Ok(n) => report.counters_purged = n,
            Err(e) => {
                warn!("Maintenance: counter purge failed: {}", e);
                report.failures += 1;
            }
        }

        match self.engine.auth.deactivate_expired_passwords(now).await {
            Ok(n) => report.passwords_expired = n,
            Err(e) => {
                warn!("Maintenance: password expiry failed: {}", e);
                report.failures += 1;
            }
        }

        match self.engine.auth.expire_sessions(now).await {
            Ok((logged, failed)) => {
                report.sessions_expired = logged;
                report.failures += failed;
            }
            Err(e) => {
                warn!("Maintenance: session expiry audit failed: {}", e);
                report.failures += 1;
            }
        }

        match self.send_expiry_warnings(now).await {
            Ok((sent, failed)) => {
                report.expiry_warnings = sent;
                report.failures += failed;
            }
            Err(e) => {
                warn!("Maintenance: expiry warnings failed: {}", e);
                report.failures += 1;
            }
        }

        match self
            .engine
            .proactive
            .cancel_stale_pending(now, self.settings.stale_pending)
            .await
        {
            Ok(n) => report.initiations_cancelled = n,
            Err(e) => {
                warn!("Maintenance: stale initiation sweep failed: {}", e);
                report.failures += 1;
            }
        }

        match self
            .engine
            .proactive
            .purge_logs_before(now - self.settings.log_retention)
            .await
        {
            Ok(n) => report.logs_purged = n,
            Err(e) => {
                warn!("Maintenance: initiation log purge failed: {}", e);
                report.failures += 1;
            }
        }

        report
    }

    async fn send_expiry_warnings(&self, now: DateTime<Utc>) -> anyhow::Result<(usize, usize)> {
        let users = self
            .engine
            .auth
            .users_needing_expiry_warning(now, self.settings.expiry_warning)
            .await?;

        let mut sent = 0;
        let mut failed = 0;
        for user in users {
            let Some(until) = user.authorized_until else {
                continue;
            };
            let content = format!(
                "Your access expires on {} UTC. Send a new password to keep talking.",
                until.format("%Y-%m-%d %H:%M")
            );
            let result = async {
                self.delivery.deliver(user.user_id, &content).await?;
                self.engine.auth.mark_expiry_warned(user.user_id).await?;
                anyhow::Ok(())
            }
            .await;
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Maintenance: expiry warning for user {} failed: {}", user.user_id, e);
                    failed += 1;
                }
            }
        }
        Ok((sent, failed))
    }
}
