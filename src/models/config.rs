//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduler and worker timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// Course-work archive settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// External grade portal adapter
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Telegram Bot API delivery
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Local document store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.sync.period_secs == 0 {
            return Err(AppError::validation("sync.period_secs must be > 0"));
        }
        if self.sync.fetch_timeout_secs == 0 {
            return Err(AppError::validation("sync.fetch_timeout_secs must be > 0"));
        }
        if self.sync.supervisor_cooldown_secs == 0 {
            return Err(AppError::validation(
                "sync.supervisor_cooldown_secs must be > 0",
            ));
        }
        if self.archive.max_part_bytes == 0 {
            return Err(AppError::validation("archive.max_part_bytes must be > 0"));
        }
        if self.provider.user_agent.trim().is_empty() {
            return Err(AppError::validation("provider.user_agent is empty"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(AppError::validation("provider.timeout_secs must be > 0"));
        }
        url::Url::parse(&self.provider.base_url).map_err(|e| {
            AppError::validation(format!(
                "provider.base_url '{}' is not a valid URL: {e}",
                self.provider.base_url
            ))
        })?;
        url::Url::parse(&self.telegram.api_base).map_err(|e| {
            AppError::validation(format!(
                "telegram.api_base '{}' is not a valid URL: {e}",
                self.telegram.api_base
            ))
        })?;
        Ok(())
    }
}

/// Scheduler and worker timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pause between scheduler ticks in seconds
    #[serde(default = "defaults::period")]
    pub period_secs: u64,

    /// Entities synced longer ago than this are considered stale
    #[serde(default = "defaults::stale_after")]
    pub stale_after_secs: u64,

    /// Pause after a failed tick before the scheduler tries again
    #[serde(default = "defaults::error_backoff")]
    pub error_backoff_secs: u64,

    /// Upper bound for one provider fetch
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Pause between two queue items in milliseconds
    #[serde(default = "defaults::politeness_delay")]
    pub politeness_delay_ms: u64,

    /// Pause before the supervisor restarts a crashed worker loop
    #[serde(default = "defaults::supervisor_cooldown")]
    pub supervisor_cooldown_secs: u64,
}

impl SyncConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms)
    }

    pub fn supervisor_cooldown(&self) -> Duration {
        Duration::from_secs(self.supervisor_cooldown_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            period_secs: defaults::period(),
            stale_after_secs: defaults::stale_after(),
            error_backoff_secs: defaults::error_backoff(),
            fetch_timeout_secs: defaults::fetch_timeout(),
            politeness_delay_ms: defaults::politeness_delay(),
            supervisor_cooldown_secs: defaults::supervisor_cooldown(),
        }
    }
}

/// Course-work archive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding built archives
    #[serde(default = "defaults::archive_dir")]
    pub dir: PathBuf,

    /// Largest allowed part, in bytes
    #[serde(default = "defaults::max_part_bytes")]
    pub max_part_bytes: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: defaults::archive_dir(),
            max_part_bytes: defaults::max_part_bytes(),
        }
    }
}

/// Grade portal adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Endpoint serving `<base_url>/<entity_id>` as a JSON snapshot
    #[serde(default = "defaults::provider_base_url")]
    pub base_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::provider_timeout")]
    pub timeout_secs: u64,

    /// Where downloaded course-work files land
    #[serde(default = "defaults::download_dir")]
    pub download_dir: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::provider_base_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::provider_timeout(),
            download_dir: defaults::download_dir(),
        }
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,

    #[serde(default = "defaults::telegram_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: defaults::telegram_api_base(),
        }
    }
}

/// Local document store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: defaults::storage_dir(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error`
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Sync defaults
    pub fn period() -> u64 {
        10 * 60
    }
    pub fn stale_after() -> u64 {
        5 * 60
    }
    pub fn error_backoff() -> u64 {
        60
    }
    pub fn fetch_timeout() -> u64 {
        10
    }
    pub fn politeness_delay() -> u64 {
        5_000
    }
    pub fn supervisor_cooldown() -> u64 {
        60
    }

    // Archive defaults
    pub fn archive_dir() -> PathBuf {
        PathBuf::from("course_work_archives")
    }
    pub fn max_part_bytes() -> u64 {
        // Kept under the 50 MiB Telegram upload ceiling
        45 * 1024 * 1024
    }

    // Provider defaults
    pub fn provider_base_url() -> String {
        "http://localhost:8080/rate/".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; grade-sync/0.1)".into()
    }
    pub fn provider_timeout() -> u64 {
        10
    }
    pub fn download_dir() -> PathBuf {
        PathBuf::from("course_works")
    }

    // Delivery defaults
    pub fn telegram_api_base() -> String {
        "https://api.telegram.org".into()
    }

    // Storage defaults
    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
