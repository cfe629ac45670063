use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;

/// Timing knobs of the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed delay before re-opening a dropped push connection.
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
    /// How long the poll confirmer keeps asking before it gives up.
    pub poll_deadline: Duration,
    /// Fallback deadline after which the order is treated as completed.
    /// Always longer than `poll_deadline`.
    pub auto_resolve_after: Duration,
    /// Extra attempts for the timer's `completed` write.
    pub finalize_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(5),
            poll_deadline: Duration::from_secs(5 * 60),
            auto_resolve_after: Duration::from_secs(10 * 60),
            finalize_retries: 3,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.poll_interval.is_zero() {
            return Err(AppError::Internal(
                "POLL_INTERVAL_MS must be > 0".to_string(),
            ));
        }
        if self.auto_resolve_after <= self.poll_deadline {
            return Err(AppError::Internal(
                "AUTO_RESOLVE_SECS must be longer than POLL_DEADLINE_SECS".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub courier_id: Uuid,
    /// Unset means the daemon runs against the in-memory sandbox backend.
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub event_buffer_size: usize,
    pub sync: SyncConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            reconnect_delay: Duration::from_millis(parse_or_default(
                "RECONNECT_DELAY_MS",
                defaults.reconnect_delay.as_millis() as u64,
            )?),
            poll_interval: Duration::from_millis(parse_or_default(
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            poll_deadline: Duration::from_secs(parse_or_default(
                "POLL_DEADLINE_SECS",
                defaults.poll_deadline.as_secs(),
            )?),
            auto_resolve_after: Duration::from_secs(parse_or_default(
                "AUTO_RESOLVE_SECS",
                defaults.auto_resolve_after.as_secs(),
            )?),
            finalize_retries: parse_or_default("FINALIZE_RETRIES", defaults.finalize_retries)?,
        };
        sync.validate()?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 7070)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            courier_id: required("COURIER_ID")?,
            backend_url: optional("BACKEND_URL"),
            backend_token: optional("BACKEND_TOKEN"),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 256)?,
            sync,
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn required<T>(key: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).map_err(|_| AppError::Internal(format!("{key} must be set")))?;
    raw.parse::<T>()
        .map_err(|err| AppError::Internal(format!("invalid {key}: {err}")))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
