use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://checkout_ledger.db?mode=rwc";

/// Checkout lifecycle thresholds
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// Inactivity after which a checkout with identifying signal is abandoned
    #[serde(default = "default_abandonment_threshold_secs")]
    #[validate(range(min = 60))]
    pub abandonment_threshold_secs: u64,

    /// Retention for checkouts without any identifying signal
    #[serde(default = "default_empty_retention_secs")]
    #[validate(range(min = 60))]
    pub empty_retention_secs: u64,

    /// Retention for abandoned checkouts, measured from their last update
    #[serde(default = "default_abandoned_retention_secs")]
    #[validate(range(min = 60))]
    pub abandoned_retention_secs: u64,

    /// Sliding completion deadline opened by a committed payment session
    #[serde(default = "default_expiry_window_secs")]
    #[validate(range(min = 60))]
    pub expiry_window_secs: u64,

    /// Attempts for a read-modify-write that loses an optimistic lock race
    #[serde(default = "default_max_update_retries")]
    #[validate(range(min = 1, max = 10))]
    pub max_update_retries: u32,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            abandonment_threshold_secs: default_abandonment_threshold_secs(),
            empty_retention_secs: default_empty_retention_secs(),
            abandoned_retention_secs: default_abandoned_retention_secs(),
            expiry_window_secs: default_expiry_window_secs(),
            max_update_retries: default_max_update_retries(),
        }
    }
}

impl CheckoutConfig {
    pub fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_window_secs as i64)
    }
}

/// Reclamation sweep cadence
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default = "default_true_bool")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,

    /// Upper bound on candidates fetched per rule and run
    #[serde(default = "default_sweep_batch_limit")]
    #[validate(range(min = 1, max = 100000))]
    pub batch_limit: u64,

    /// Deadline for handling a single checkout
    #[serde(default = "default_sweep_item_timeout_ms")]
    #[validate(range(min = 10))]
    pub item_timeout_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            batch_limit: default_sweep_batch_limit(),
            item_timeout_ms: default_sweep_item_timeout_ms(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 1000))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Deadline applied to every store call
    #[serde(default = "default_store_timeout_ms")]
    #[validate(range(min = 10, max = 600000))]
    pub store_timeout_ms: u64,

    /// Currency used when a checkout is opened without one
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency")]
    pub default_currency: String,

    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1, max = 1000000))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub sweep: SweepConfig,
}

impl AppConfig {
    /// Builds a configuration with defaults for everything but the database.
    pub fn new(database_url: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            environment: environment.into(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            default_currency: default_currency(),
            event_channel_capacity: default_event_channel_capacity(),
            checkout: CheckoutConfig::default(),
            sweep: SweepConfig::default(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_true_bool() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_abandonment_threshold_secs() -> u64 {
    15 * 60
}

fn default_empty_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_abandoned_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_expiry_window_secs() -> u64 {
    30 * 60
}

fn default_max_update_retries() -> u32 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_sweep_batch_limit() -> u64 {
    500
}

fn default_sweep_item_timeout_ms() -> u64 {
    5_000
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("default_currency");
        err.message = Some("Must be a three letter upper-case ISO-4217 code".into());
        Err(err)
    }
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("{},sea_orm=warn,sqlx=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads configuration from `./config` and `APP__*` environment variables.
///
/// The profile is chosen by `RUN_ENV` (or `APP_ENV`), defaulting to development.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Layers defaults, `<dir>/default.toml`, `<dir>/<run_env>.toml` and the
/// environment, then validates the result.
pub fn load_config_from(dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn defaults_apply_without_files() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(dir.path(), "test").unwrap();

        assert_eq!(config.environment, "test");
        assert_eq!(config.default_currency, "USD");
        assert_eq!(config.checkout.abandonment_threshold_secs, 900);
        assert_eq!(config.checkout.empty_retention_secs, 86_400);
        assert_eq!(config.checkout.abandoned_retention_secs, 604_800);
        assert_eq!(config.store_timeout(), Duration::from_secs(5));
        assert!(config.sweep.enabled);
    }

    #[test]
    fn profile_file_overrides_default_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            database_url = "postgres://localhost/checkout"
            store_timeout_ms = 2000

            [checkout]
            abandonment_threshold_secs = 1200
            "#,
        );
        write(
            &dir,
            "staging.toml",
            r#"
            store_timeout_ms = 750

            [sweep]
            interval_secs = 60
            "#,
        );

        let config = load_config_from(dir.path(), "staging").unwrap();
        assert_eq!(config.database_url(), "postgres://localhost/checkout");
        assert_eq!(config.store_timeout_ms, 750);
        assert_eq!(config.checkout.abandonment_threshold_secs, 1200);
        assert_eq!(config.sweep.interval_secs, 60);
        assert_eq!(config.sweep.batch_limit, 500);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            log_level = "loud"
            default_currency = "usd"
            "#,
        );

        let err = load_config_from(dir.path(), "development").unwrap_err();
        assert!(matches!(err, AppConfigError::Validation(_)));
    }

    #[test]
    fn unknown_section_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            [checkout]
            abandon_after = 10
            "#,
        );

        assert!(matches!(
            load_config_from(dir.path(), "development"),
            Err(AppConfigError::Load(_))
        ));
    }

    #[test]
    fn log_level_validation() {
        assert!(validate_log_level("debug").is_ok());
        assert!(validate_log_level("verbose").is_err());
    }
}
