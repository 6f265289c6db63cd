//! Configuration for Comanda

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at the configuration file
pub const CONFIG_PATH_ENV: &str = "COMANDA_CONFIG";

/// Prefix for environment overrides (`COMANDA__DELIVERY__MAX_RETRIES=5`)
pub const ENV_PREFIX: &str = "COMANDA";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Daily automation job configuration
    #[serde(default)]
    pub automation: AutomationConfig,

    /// Segment classification thresholds
    #[serde(default)]
    pub segmentation: SegmentationConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Shared secret required by the job trigger endpoints.
    /// When unset, every protected endpoint answers 401.
    #[serde(default)]
    pub job_secret: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            job_secret: None,
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Daily automation job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Run the daily job from the built-in scheduler
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,

    /// UTC hour at which the built-in scheduler fires
    #[serde(default = "default_daily_run_hour")]
    pub daily_run_hour_utc: u32,

    /// Customers recomputed concurrently per batch
    #[serde(default = "default_stats_batch_size")]
    pub stats_batch_size: usize,

    /// Safety cap on candidates fetched per rule
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,

    /// Deadline for a whole orchestrator pass
    #[serde(default = "default_run_deadline")]
    pub run_deadline_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            daily_run_hour_utc: default_daily_run_hour(),
            stats_batch_size: default_stats_batch_size(),
            candidate_limit: default_candidate_limit(),
            run_deadline_secs: default_run_deadline(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_daily_run_hour() -> u32 {
    12
}

fn default_stats_batch_size() -> usize {
    20
}

fn default_candidate_limit() -> i64 {
    100
}

fn default_run_deadline() -> u64 {
    1800
}

/// Thresholds used to classify customers into segments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Visits needed to count as a regular
    #[serde(default = "default_regular_min_visits")]
    pub regular_min_visits: i32,

    /// Visits needed to count as VIP
    #[serde(default = "default_vip_min_visits")]
    pub vip_min_visits: i32,

    /// Lifetime spend needed to count as VIP
    #[serde(default = "default_vip_min_spent")]
    pub vip_min_spent: f64,

    /// Days without a visit before a customer is at risk
    #[serde(default = "default_at_risk_after_days")]
    pub at_risk_after_days: i64,

    /// Days without a visit before a customer is inactive
    #[serde(default = "default_inactive_after_days")]
    pub inactive_after_days: i64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            regular_min_visits: default_regular_min_visits(),
            vip_min_visits: default_vip_min_visits(),
            vip_min_spent: default_vip_min_spent(),
            at_risk_after_days: default_at_risk_after_days(),
            inactive_after_days: default_inactive_after_days(),
        }
    }
}

fn default_regular_min_visits() -> i32 {
    3
}

fn default_vip_min_visits() -> i32 {
    10
}

fn default_vip_min_spent() -> f64 {
    1000.0
}

fn default_at_risk_after_days() -> i64 {
    30
}

fn default_inactive_after_days() -> i64 {
    60
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Run the polling worker inside the server process
    #[serde(default = "default_true")]
    pub worker_enabled: bool,

    /// Seconds between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Due messages fetched per pass
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: i64,

    /// Messages sent concurrently per batch
    #[serde(default = "default_delivery_batch_size")]
    pub batch_size: usize,

    /// Minimum spacing between batch starts
    #[serde(default = "default_batch_pacing")]
    pub batch_pacing_ms: u64,

    /// Retries allowed after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Linear backoff step (delay = base * retry_count)
    #[serde(default = "default_retry_delay_base")]
    pub retry_delay_base_secs: i64,

    /// Timeout around a single provider call
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,

    /// No new batch is started after this many seconds
    #[serde(default = "default_pass_deadline")]
    pub pass_deadline_secs: u64,

    /// Claims older than this are returned to the queue
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            poll_interval_secs: default_poll_interval(),
            fetch_limit: default_fetch_limit(),
            batch_size: default_delivery_batch_size(),
            batch_pacing_ms: default_batch_pacing(),
            max_retries: default_max_retries(),
            retry_delay_base_secs: default_retry_delay_base(),
            transport_timeout_secs: default_transport_timeout(),
            pass_deadline_secs: default_pass_deadline(),
            stale_claim_minutes: default_stale_claim_minutes(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_fetch_limit() -> i64 {
    50
}

fn default_delivery_batch_size() -> usize {
    10
}

fn default_batch_pacing() -> u64 {
    1000
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_delay_base() -> i64 {
    300
}

fn default_transport_timeout() -> u64 {
    15
}

fn default_pass_deadline() -> u64 {
    120
}

fn default_stale_claim_minutes() -> i64 {
    15
}

impl Config {
    /// Load configuration from a TOML file, with `COMANDA__*` environment overrides
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Load configuration from `COMANDA_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/comanda/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let delivery = DeliveryConfig::default();
        assert_eq!(delivery.fetch_limit, 50);
        assert_eq!(delivery.batch_size, 10);
        assert_eq!(delivery.max_retries, 3);

        let automation = AutomationConfig::default();
        assert_eq!(automation.stats_batch_size, 20);
        assert_eq!(automation.candidate_limit, 100);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
url = "postgres://localhost/comanda"

[api]
port = 9090
job_secret = "s3cret"

[delivery]
max_retries = 5
retry_delay_base_secs = 60

[segmentation]
inactive_after_days = 90
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.url, "postgres://localhost/comanda");
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.job_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.delivery.batch_size, 10);
        assert_eq!(config.segmentation.inactive_after_days, 90);
        assert_eq!(config.segmentation.at_risk_after_days, 30);
        assert_eq!(config.logging.format, "json");
    }
}
