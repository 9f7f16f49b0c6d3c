use crate::access::FailMode;
use std::{collections::HashSet, env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;

const MIN_REFRESH_SECS: u64 = 5;
const MAX_MEDIA_GROUP: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing {0} environment variable")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide settings, read once at startup and passed down by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub redis_url: String,
    pub automation_url: String,
    pub health_port: u16,
    pub admin_ids: HashSet<u64>,
    pub work_dir: PathBuf,
    pub backup_path: PathBuf,
    pub default_crop_percent: u8,
    pub access: AccessSettings,
    pub extraction: ExtractionSettings,
    pub fetch: FetchSettings,
    pub delivery: DeliverySettings,
    pub retry_jitter: Duration,
    pub rate_limit_max_waits: u32,
}

#[derive(Debug, Clone)]
pub struct AccessSettings {
    pub refresh_interval: Duration,
    pub fail_mode: FailMode,
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub concurrency: usize,
    pub page_load_timeout: Duration,
    pub element_wait: Duration,
    pub overlay_wait: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub rate_per_sec: f64,
    pub retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub batch_size: usize,
    pub batch_attempts: u32,
    pub item_attempts: u32,
    pub retry_delay: Duration,
    pub timeout_base: Duration,
    pub timeout_step: Duration,
    pub timeout_max: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = env::var("BOT_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("BOT_TOKEN"))?;

        let fail_mode = match env::var("ACCESS_FAIL_MODE") {
            Ok(raw) => raw.parse::<FailMode>().map_err(|_| ConfigError::Invalid {
                key: "ACCESS_FAIL_MODE",
                value: raw,
            })?,
            Err(_) => FailMode::Open,
        };

        let refresh_secs = env_or("WHITELIST_REFRESH_SECS", 30u64).max(MIN_REFRESH_SECS);

        Ok(Self {
            bot_token,
            redis_url: env_string("REDIS_URL", "redis://localhost:6379/0"),
            automation_url: env_string("SELENIUM_URL", "http://localhost:4444/wd/hub"),
            health_port: env_or("HEALTH_PORT", 8080u16),
            admin_ids: parse_admin_ids(env::var("ADMIN_IDS").ok().as_deref()),
            work_dir: PathBuf::from(env_string("WORK_DIR", "images")),
            backup_path: PathBuf::from(env_string(
                "WHITELIST_BACKUP_PATH",
                "data/whitelist_backup.json",
            )),
            default_crop_percent: env_or("DEFAULT_CROP_PERCENT", 15u8).min(100),
            access: AccessSettings {
                refresh_interval: Duration::from_secs(refresh_secs),
                fail_mode,
            },
            extraction: ExtractionSettings {
                concurrency: env_or("AUTOMATION_CONCURRENCY", 2usize).max(1),
                page_load_timeout: Duration::from_secs(env_or("PAGE_LOAD_TIMEOUT_SECS", 15)),
                element_wait: Duration::from_secs(env_or("ELEMENT_WAIT_SECS", 10)),
                overlay_wait: Duration::from_secs(env_or("OVERLAY_WAIT_SECS", 5)),
                retries: env_or("EXTRACT_RETRIES", 2),
                backoff: Duration::from_millis(env_or("EXTRACT_BACKOFF_MS", 2000)),
            },
            fetch: FetchSettings {
                rate_per_sec: env::var("RATE_LIMIT_RPS")
                    .ok()
                    .and_then(|v| v.parse::<f64>().ok())
                    .filter(|v| *v > 0.0)
                    .unwrap_or(5.0),
                retries: env_or("FETCH_RETRIES", 2),
                backoff: Duration::from_millis(env_or("FETCH_BACKOFF_MS", 1000)),
                timeout: Duration::from_secs(env_or("FETCH_TIMEOUT_SECS", 20)),
            },
            delivery: DeliverySettings {
                batch_size: env_or("DELIVERY_BATCH_SIZE", MAX_MEDIA_GROUP).clamp(1, MAX_MEDIA_GROUP),
                batch_attempts: env_or("DELIVERY_ATTEMPTS", 5u32).max(1),
                item_attempts: env_or("DELIVERY_ITEM_ATTEMPTS", 3u32).max(1),
                retry_delay: Duration::from_millis(env_or("DELIVERY_RETRY_DELAY_MS", 3000)),
                timeout_base: Duration::from_secs(env_or("DELIVERY_TIMEOUT_BASE_SECS", 60)),
                timeout_step: Duration::from_secs(env_or("DELIVERY_TIMEOUT_STEP_SECS", 30)),
                timeout_max: Duration::from_secs(env_or("DELIVERY_TIMEOUT_MAX_SECS", 180)),
            },
            retry_jitter: Duration::from_millis(env_or("RETRY_JITTER_MS", 0)),
            rate_limit_max_waits: env_or("RATE_LIMIT_MAX_WAITS", 10),
        })
    }
}

pub fn parse_admin_ids(raw: Option<&str>) -> HashSet<u64> {
    let mut out = HashSet::new();
    for part in raw.unwrap_or_default().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<u64>() {
            Ok(id) => {
                out.insert(id);
            }
            Err(_) => warn!(
                target = "listing_bot.config",
                "ignored malformed ADMIN_IDS entry: {part}"
            ),
        }
    }
    out
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
