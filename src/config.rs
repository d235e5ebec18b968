use crate::db::Database;
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Upper bounds for duration-like settings. Larger values are rejected when
/// loaded so time arithmetic on them stays in range.
pub const MAX_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;
pub const MAX_RETENTION_DAYS: u32 = 36_500;
pub const MAX_INTERVAL_HOURS: u32 = 24 * 365;

/// Process-level settings. Read once at startup from the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub tunables_file: Option<String>,

    // Background loop cadence
    pub planning_interval_secs: u64,
    pub sender_interval_secs: u64,
    pub sender_batch_size: usize,
    pub maintenance_interval_secs: u64,
    pub config_reload_interval_secs: u64,

    // Initiation timing (local hours in the user's timezone)
    pub active_hours_start: u32,
    pub active_hours_end: u32,

    // Maintenance windows
    pub counter_retention_days: i64,
    pub initiation_log_retention_days: i64,
    pub stale_pending_hours: i64,
    pub expiry_warning_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let config = Config {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "data/rapport.db".to_string()),
            tunables_file: env::var("TUNABLES_FILE").ok().filter(|p| !p.trim().is_empty()),
            planning_interval_secs: env::var("PLANNING_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
            sender_interval_secs: env::var("SENDER_INTERVAL_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            sender_batch_size: env::var("SENDER_BATCH_SIZE")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .unwrap_or(50),
            maintenance_interval_secs: env::var("MAINTENANCE_INTERVAL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .unwrap_or(86400),
            config_reload_interval_secs: env::var("CONFIG_RELOAD_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
            active_hours_start: env::var("INITIATION_ACTIVE_HOURS_START")
                .unwrap_or_else(|_| "9".to_string())
                .parse()
                .unwrap_or(9),
            active_hours_end: env::var("INITIATION_ACTIVE_HOURS_END")
                .unwrap_or_else(|_| "23".to_string())
                .parse()
                .unwrap_or(23),
            counter_retention_days: env::var("COUNTER_RETENTION_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .unwrap_or(7),
            initiation_log_retention_days: env::var("INITIATION_LOG_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            stale_pending_hours: env::var("STALE_PENDING_HOURS")
                .unwrap_or_else(|_| "48".to_string())
                .parse()
                .unwrap_or(48),
            expiry_warning_days: env::var("EXPIRY_WARNING_DAYS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
        };

        let max_days = i64::from(MAX_RETENTION_DAYS);
        for (name, value, max) in [
            ("COUNTER_RETENTION_DAYS", config.counter_retention_days, max_days),
            ("INITIATION_LOG_RETENTION_DAYS", config.initiation_log_retention_days, max_days),
            ("STALE_PENDING_HOURS", config.stale_pending_hours, max_days * 24),
            ("EXPIRY_WARNING_DAYS", config.expiry_warning_days, max_days),
        ] {
            if !(1..=max).contains(&value) {
                anyhow::bail!("{} ({}) must be between 1 and {}", name, value, max);
            }
        }

        if config.active_hours_start >= config.active_hours_end || config.active_hours_end > 24 {
            anyhow::bail!(
                "INITIATION_ACTIVE_HOURS_START ({}) must be before INITIATION_ACTIVE_HOURS_END ({}) within 0-24",
                config.active_hours_start,
                config.active_hours_end
            );
        }

        Ok(config)
    }

    pub fn active_hours(&self) -> (u32, u32) {
        (self.active_hours_start, self.active_hours_end)
    }
}

/// The engine's named policy knobs. Values arrive as strings (file or
/// `system_config` table) and are parsed over explicit defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct Tunables {
    pub daily_message_limit: u32,
    pub max_auto_saves_per_day: u32,
    pub auto_save_importance: u8,
    pub ltm_max_records_per_user: u32,
    pub ltm_auto_cleanup_days: u32,
    pub auth_timeout_seconds: u64,
    pub bruteforce_timeout_seconds: u64,
    pub max_password_attempts: u32,
    pub proactive_enabled_globally: bool,
    pub proactive_min_interval_hours: u32,
    pub proactive_max_per_day: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            daily_message_limit: 10,
            max_auto_saves_per_day: 4,
            auto_save_importance: 5,
            ltm_max_records_per_user: 1000,
            ltm_auto_cleanup_days: 365,
            auth_timeout_seconds: 300,
            bruteforce_timeout_seconds: 900,
            max_password_attempts: 5,
            proactive_enabled_globally: true,
            proactive_min_interval_hours: 3,
            proactive_max_per_day: 4,
        }
    }
}

impl Tunables {
    pub const KEYS: [&'static str; 11] = [
        "daily_message_limit",
        "max_auto_saves_per_day",
        "auto_save_importance",
        "ltm_max_records_per_user",
        "ltm_auto_cleanup_days",
        "auth_timeout_seconds",
        "bruteforce_timeout_seconds",
        "max_password_attempts",
        "proactive_enabled_globally",
        "proactive_min_interval_hours",
        "proactive_max_per_day",
    ];

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tunables = Tunables::default();
        for (key, value) in pairs {
            tunables.apply(key.as_ref(), value.as_ref());
        }
        tunables
    }

    /// Applies one string-typed entry. Unknown keys, unparseable values and
    /// values out of range leave the current value in place.
    pub fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        let applied = match key {
            "daily_message_limit" => set(&mut self.daily_message_limit, value),
            "max_auto_saves_per_day" => set(&mut self.max_auto_saves_per_day, value),
            "auto_save_importance" => set_within(&mut self.auto_save_importance, value, 1..=10),
            "ltm_max_records_per_user" => set(&mut self.ltm_max_records_per_user, value),
            "ltm_auto_cleanup_days" => {
                set_within(&mut self.ltm_auto_cleanup_days, value, 1..=MAX_RETENTION_DAYS)
            }
            "auth_timeout_seconds" => {
                set_within(&mut self.auth_timeout_seconds, value, 1..=MAX_TIMEOUT_SECONDS)
            }
            "bruteforce_timeout_seconds" => {
                set_within(&mut self.bruteforce_timeout_seconds, value, 0..=MAX_TIMEOUT_SECONDS)
            }
            "max_password_attempts" => set_within(&mut self.max_password_attempts, value, 1..=u32::MAX),
            "proactive_enabled_globally" => match parse_flag(value) {
                Some(v) => {
                    self.proactive_enabled_globally = v;
                    true
                }
                None => false,
            },
            "proactive_min_interval_hours" => {
                set_within(&mut self.proactive_min_interval_hours, value, 0..=MAX_INTERVAL_HOURS)
            }
            "proactive_max_per_day" => set(&mut self.proactive_max_per_day, value),
            _ => {
                debug!("Config: ignoring unknown key '{}'", key);
                return;
            }
        };

        if !applied {
            warn!("Config: invalid value '{}' for '{}', keeping previous", value, key);
        }
    }

    /// Clamped to `MAX_TIMEOUT_SECONDS`, as are the other timeouts.
    pub fn lockout_duration(&self) -> chrono::Duration {
        bounded_seconds(self.bruteforce_timeout_seconds)
    }

    pub fn auth_prompt_timeout(&self) -> chrono::Duration {
        bounded_seconds(self.auth_timeout_seconds)
    }

    /// Loads string-typed entries from a TOML file. Non-string scalars are
    /// accepted and rendered back to their textual form.
    pub fn load_file_pairs(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
        let content = fs::read_to_string(path)?;
        let table: toml::Table = toml::from_str(&content)?;
        let mut pairs = BTreeMap::new();
        for (key, value) in table {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Float(f) => f.to_string(),
                other => {
                    warn!("Config: '{}' in {} is not a scalar ({})", key, path.display(), other.type_str());
                    continue;
                }
            };
            pairs.insert(key, text);
        }
        Ok(pairs)
    }
}

fn set<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.parse::<T>() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => false,
    }
}

fn set_within<T>(slot: &mut T, value: &str, range: std::ops::RangeInclusive<T>) -> bool
where
    T: std::str::FromStr + PartialOrd,
{
    match value.parse::<T>() {
        Ok(v) if range.contains(&v) => {
            *slot = v;
            true
        }
        _ => false,
    }
}

fn bounded_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_TIMEOUT_SECONDS) as i64)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Hands out consistent `Tunables` snapshots and swaps them on reload.
pub struct ConfigProvider {
    current: RwLock<Arc<Tunables>>,
    file: Option<PathBuf>,
}

impl ConfigProvider {
    pub fn new(initial: Tunables, file: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            file,
        }
    }

    pub fn fixed(tunables: Tunables) -> Self {
        Self::new(tunables, None)
    }

    pub fn snapshot(&self) -> Arc<Tunables> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, tunables: Tunables) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(tunables);
    }

    /// Rebuilds the snapshot: defaults, then the tunables file, then the
    /// `system_config` table. The previous snapshot stays live until the new
    /// one is complete.
    pub async fn reload(&self, db: &Database) -> anyhow::Result<Arc<Tunables>> {
        let mut next = Tunables::default();

        if let Some(path) = &self.file {
            match Tunables::load_file_pairs(path) {
                Ok(pairs) => {
                    for (k, v) in &pairs {
                        next.apply(k, v);
                    }
                }
                Err(e) => warn!("Config: failed to read {}: {}", path.display(), e),
            }
        }

        let stored = db.run_blocking(|db| db.load_system_config()).await?;
        for (k, v) in &stored {
            next.apply(k, v);
        }

        let changed = *self.snapshot() != next;
        self.replace(next);
        if changed {
            info!("Config: tunables reloaded");
        }
        Ok(self.snapshot())
    }
}
