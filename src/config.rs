use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.razorpay.com";
const DEFAULT_INTENT_TTL_SECS: u64 = 15 * 60;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COUPON_LOOKBACK_DAYS: i64 = 30;
const DEFAULT_UNPAID_ORDER_TTL_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Payment gateway credentials and limits.
///
/// Passed explicitly to the gateway adapter; nothing reads the secret from
/// process-wide state.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentGatewayConfig {
    /// Base URL of the gateway REST API
    #[serde(default = "default_gateway_base_url")]
    #[validate(length(min = 1))]
    pub base_url: String,

    /// Public key id used for basic auth
    #[serde(default)]
    pub key_id: String,

    /// Shared secret used for basic auth and callback signatures
    #[serde(default)]
    pub key_secret: String,

    /// ISO currency code sent with every intent
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// How long a created intent stays payable
    #[serde(default = "default_intent_ttl_secs")]
    #[validate(range(min = 60, max = 604_800))]
    pub intent_ttl_secs: u64,

    /// Outbound request timeout
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            key_id: String::new(),
            key_secret: String::new(),
            currency: default_currency(),
            intent_ttl_secs: default_intent_ttl_secs(),
            request_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl PaymentGatewayConfig {
    pub fn intent_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.intent_ttl_secs as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Temporal windows applied by the checkout and payment services.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutPolicy {
    /// Sessions younger than this referencing a coupon block destructive coupon edits
    #[serde(default = "default_coupon_lookback_days")]
    #[validate(range(min = 1, max = 365))]
    pub coupon_in_use_lookback_days: i64,

    /// Online orders with no payment intent are cancelled after this long
    #[serde(default = "default_unpaid_order_ttl_secs")]
    #[validate(range(min = 60, max = 2_592_000))]
    pub unpaid_order_ttl_secs: u64,

    /// Interval between abandoned-payment sweeps in the worker
    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub expiry_sweep_interval_secs: u64,
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        Self {
            coupon_in_use_lookback_days: default_coupon_lookback_days(),
            unpaid_order_ttl_secs: default_unpaid_order_ttl_secs(),
            expiry_sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CheckoutPolicy {
    pub fn coupon_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.coupon_in_use_lookback_days)
    }

    pub fn unpaid_order_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.unpaid_order_ttl_secs as i64)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
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

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub event_channel_capacity: usize,

    /// Payment gateway configuration
    #[serde(default)]
    #[validate]
    pub payment: PaymentGatewayConfig,

    /// Checkout policy windows
    #[serde(default)]
    #[validate]
    pub policy: CheckoutPolicy,
}

impl AppConfig {
    /// Create a configuration with explicit values and defaults for the rest.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            payment: PaymentGatewayConfig::default(),
            policy: CheckoutPolicy::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks that cannot be expressed as field attributes.
    pub fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.db_min_connections > self.db_max_connections {
            errors.add(
                "db_min_connections",
                ValidationError::new("min_connections_exceeds_max"),
            );
        }
        if self.is_production() && self.payment.key_secret.trim().is_empty() {
            errors.add("payment", ValidationError::new("missing_gateway_secret"));
        }
        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ConfigError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}
fn default_intent_ttl_secs() -> u64 {
    DEFAULT_INTENT_TTL_SECS
}
fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}
fn default_coupon_lookback_days() -> i64 {
    DEFAULT_COUPON_LOOKBACK_DAYS
}
fn default_unpaid_order_ttl_secs() -> u64 {
    DEFAULT_UNPAID_ORDER_TTL_SECS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
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
fn default_event_channel_capacity() -> usize {
    1024
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.policy.coupon_in_use_lookback_days, 30);
        assert_eq!(cfg.payment.currency, "INR");
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.log_level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn production_requires_gateway_secret() {
        let cfg = AppConfig::new("postgres://localhost/shop".into(), "production".into());
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn rejects_out_of_range_payment_windows() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.policy.unpaid_order_ttl_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.payment.intent_ttl_secs = 10 * 365 * 24 * 3600;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn policy_helpers_match_configured_windows() {
        let policy = CheckoutPolicy::default();
        assert_eq!(policy.coupon_lookback(), chrono::Duration::days(30));
        assert_eq!(policy.unpaid_order_ttl(), chrono::Duration::seconds(1800));
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.db_min_connections = 20;
        cfg.db_max_connections = 5;
        assert!(cfg.validate_additional_constraints().is_err());
    }
}
