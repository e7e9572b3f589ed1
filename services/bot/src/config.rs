use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Longest lifetime S3 accepts for a presigned URL (7 days)
const MAX_PRESIGNED_SECS: u64 = 7 * 24 * 3600;

/// Upper bound for retention, sweep period and grace windows (10 years)
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the bot service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Telegram transport configuration
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Size routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Staged file expiry configuration
    #[serde(default)]
    pub expiry: ExpiryConfig,
    /// Remote object storage; staging is disabled when absent
    #[serde(default)]
    pub s3: Option<S3Config>,
    /// Media fetcher configuration
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// Persistence configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Telegram Bot API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: String,
    /// Bot API base URL
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Long polling timeout in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Timeout for regular API requests in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Public webhook URL; long polling is used when absent
    pub webhook_url: Option<String>,
    /// Secret token Telegram echoes in the webhook header
    pub webhook_secret: Option<String>,
    /// Webhook listen address
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Webhook listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Maximum number of updates handled concurrently
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Size routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Largest file delivered inline through the chat transport (50MB default)
    #[serde(default = "default_inline_max_bytes")]
    pub inline_max_bytes: u64,
}

/// Staged file expiry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    /// How long a staged file stays available, in seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Period between sweeps, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Failed deletions before a record is abandoned (unlimited when absent)
    #[serde(default)]
    pub max_delete_attempts: Option<u32>,
    /// How long a Deleted record is kept before the sweep drops it, in seconds
    #[serde(default = "default_prune_after_secs")]
    pub prune_after_secs: u64,
}

/// S3 storage configuration
///
/// The credentials need `s3:PutObject`, `s3:GetObject`, `s3:DeleteObject`,
/// `s3:AbortMultipartUpload` and `s3:ListBucket`. Without `s3:ListBucket`
/// a HEAD on a missing key answers 403 instead of 404.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for staged files
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Prefix for every staged object key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Public base URL for the bucket; presigned URLs are used when absent
    pub public_base_url: Option<String>,
    /// Upload timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Delete timeout in seconds
    #[serde(default = "default_delete_timeout_secs")]
    pub delete_timeout_secs: u64,
    /// Multipart upload threshold in bytes (8MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Part size for multipart uploads in bytes (8MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Media fetcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Path or name of the yt-dlp executable
    #[serde(default = "default_fetcher_binary")]
    pub binary: String,
    /// Directory for per-request download folders
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Upper bound for one extraction run, in seconds
    #[serde(default = "default_fetcher_timeout_secs")]
    pub timeout_secs: u64,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_service_name() -> String {
    "harti-bot".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_max_concurrent_requests() -> usize {
    4
}

fn default_inline_max_bytes() -> u64 {
    50 * 1024 * 1024 // Bot API upload limit
}

fn default_retention_secs() -> u64 {
    12 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    30 * 60
}

fn default_prune_after_secs() -> u64 {
    7 * 24 * 3600
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "staged".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    600
}

fn default_delete_timeout_secs() -> u64 {
    30
}

fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

fn default_fetcher_binary() -> String {
    "yt-dlp".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("harti")
}

fn default_fetcher_timeout_secs() -> u64 {
    900
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/state.json")
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "harti-bot")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/bot").required(false))
            .add_source(config::File::with_name("/etc/harti/bot").required(false))
            // HARTI__ROUTING__INLINE_MAX_BYTES -> routing.inline_max_bytes
            .add_source(
                config::Environment::with_prefix("HARTI")
                    .separator("__")
                    .try_parsing(true),
            )
            // Plain BOT_TOKEN as used by most hosting dashboards
            .set_override_option("telegram.bot_token", std::env::var("BOT_TOKEN").ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check required credentials and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "telegram.bot_token (or BOT_TOKEN)".to_string(),
            ));
        }

        if self.routing.inline_max_bytes == 0 {
            return Err(invalid("routing.inline_max_bytes", "must be greater than zero"));
        }

        if self.expiry.retention_secs == 0 || self.expiry.retention_secs > MAX_WINDOW_SECS {
            return Err(invalid(
                "expiry.retention_secs",
                "must be between 1 second and 10 years",
            ));
        }

        if self.expiry.sweep_interval_secs == 0 || self.expiry.sweep_interval_secs > MAX_WINDOW_SECS {
            return Err(invalid(
                "expiry.sweep_interval_secs",
                "must be between 1 second and 10 years",
            ));
        }

        if self.expiry.prune_after_secs > MAX_WINDOW_SECS {
            return Err(invalid("expiry.prune_after_secs", "must be at most 10 years"));
        }

        if self.expiry.max_delete_attempts == Some(0) {
            return Err(invalid("expiry.max_delete_attempts", "must be at least 1"));
        }

        if self.telegram.max_concurrent_requests == 0 {
            return Err(invalid(
                "telegram.max_concurrent_requests",
                "must be greater than zero",
            ));
        }

        if let Some(ref s3) = self.s3 {
            if s3.bucket.trim().is_empty() {
                return Err(invalid("s3.bucket", "must not be empty"));
            }
            // Presigned links have to stay valid for the whole retention window
            if s3.public_base_url.is_none() && self.expiry.retention_secs > MAX_PRESIGNED_SECS {
                return Err(invalid(
                    "expiry.retention_secs",
                    "exceeds the 7 day presigned URL limit; set s3.public_base_url",
                ));
            }
            // S3 rejects multipart parts under 5MB
            if s3.part_size_bytes < 5 * 1024 * 1024 {
                return Err(invalid("s3.part_size_bytes", "must be at least 5MB"));
            }
        }

        Ok(())
    }

    /// Get retention window as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.expiry.retention_secs)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry.sweep_interval_secs)
    }

    /// Get fetcher timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetcher.timeout_secs)
    }

    /// Whether updates arrive through a webhook instead of long polling
    pub fn webhook_enabled(&self) -> bool {
        self.telegram.webhook_url.is_some()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl S3Config {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: default_api_base_url(),
            poll_timeout_secs: default_poll_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            webhook_url: None,
            webhook_secret: None,
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            inline_max_bytes: default_inline_max_bytes(),
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_delete_attempts: None,
            prune_after_secs: default_prune_after_secs(),
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            binary: default_fetcher_binary(),
            work_dir: default_work_dir(),
            timeout_secs: default_fetcher_timeout_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}
