//! Configuration and environment selection.
use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Environment variable that overrides the gateway base URL.
pub const BASE_URL_ENV: &str = "FATOORA_ZATCA_BASE_URL";
/// Environment variable holding the base64 master secret for key encryption.
pub const MASTER_KEY_ENV: &str = "FATOORA_MASTER_KEY";

/// ZATCA environment selection for API endpoints.
/// This determines which URL the gateway client will use and also selects the
/// certificate template name written into generated CSRs.
/// - NonProduction: what ZATCA refers to as the "Integration Sandbox".
/// - Simulation: the "Simulation Test Environment".
/// - Production: the live production environment.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use fatoora_compliance::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("simulation")?;
/// assert_eq!(env, EnvironmentType::Simulation);
/// # Ok::<(), fatoora_compliance::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    NonProduction,
    Simulation,
    Production,
}

impl FromStr for EnvironmentType {
    type Err = ConfigError;
    fn from_str(env: &str) -> Result<EnvironmentType, ConfigError> {
        match env.trim().to_ascii_lowercase().as_str() {
            "non_production" | "sandbox" => Ok(EnvironmentType::NonProduction),
            "simulation" => Ok(EnvironmentType::Simulation),
            "production" => Ok(EnvironmentType::Production),
            _ => Err(ConfigError::InvalidEnvironment {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::NonProduction => "non_production",
            EnvironmentType::Simulation => "simulation",
            EnvironmentType::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::NonProduction => {
                "https://gw-fatoora.zatca.gov.sa/e-invoicing/developer-portal/"
            }
            EnvironmentType::Simulation => {
                "https://gw-fatoora.zatca.gov.sa/e-invoicing/simulation/"
            }
            EnvironmentType::Production => "https://gw-fatoora.zatca.gov.sa/e-invoicing/core/",
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment type: {input}")]
    InvalidEnvironment { input: String },

    #[error("failed to open config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: java_properties::PropertiesError,
    },

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// HTTP settings for the gateway client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Overrides the environment's endpoint when set.
    pub base_url: Option<String>,
    /// Timeout for clearance calls; the caller blocks on these.
    pub clearance_timeout: Duration,
    pub reporting_timeout: Duration,
    /// Timeout for onboarding, production issuance and compliance checks.
    pub default_timeout: Duration,
    pub accept_language: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: None,
            clearance_timeout: Duration::from_secs(30),
            reporting_timeout: Duration::from_secs(10),
            default_timeout: Duration::from_secs(15),
            accept_language: "en".to_string(),
        }
    }
}

/// Fixed-window request budget shared by every gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff for transient gateway failures.
///
/// The delay before retry `n` (zero based) is `base_delay * multiplier^n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

/// Upper bound on a single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
pub const MAX_RETRY_MULTIPLIER: f64 = 10.0;
/// Upper bound on `RotationSettings::default_validity_days`.
pub const MAX_VALIDITY_DAYS: i64 = 3650;

impl RetryPolicy {
    /// Backoff before retry `attempt`, capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let seconds = self.base_delay.as_secs_f64() * factor;
        if !seconds.is_finite() || seconds >= MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        self.base_delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

/// Background certificate sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSettings {
    pub sweep_interval: Duration,
    /// Certificates expiring within this many days raise a renewal signal.
    pub warning_window_days: i64,
    /// Validity assumed when the authority token carries no usable window.
    pub default_validity_days: i64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            warning_window_days: 30,
            default_validity_days: 365,
        }
    }
}

/// Configuration for the compliance pipeline.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::NonProduction);
/// assert_eq!(config.env(), EnvironmentType::NonProduction);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    env: EnvironmentType,
    pub gateway: GatewaySettings,
    pub rate_limit: RateLimitSettings,
    pub retry: RetryPolicy,
    pub rotation: RotationSettings,
    /// Standard invoices with a tax-inclusive total above this go to clearance.
    pub clearance_threshold: Amount,
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            gateway: GatewaySettings::default(),
            rate_limit: RateLimitSettings::default(),
            retry: RetryPolicy::default(),
            rotation: RotationSettings::default(),
            clearance_threshold: Amount::from_halalas(1_000_00),
        }
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    /// Base URL for gateway calls, always ending in `/`.
    ///
    /// Precedence: `FATOORA_ZATCA_BASE_URL`, then `gateway.base_url`, then the
    /// environment's endpoint.
    pub fn base_url(&self) -> String {
        std::env::var(BASE_URL_ENV)
            .ok()
            .or_else(|| self.gateway.base_url.clone())
            .map(|value| {
                if value.ends_with('/') {
                    value
                } else {
                    format!("{value}/")
                }
            })
            .unwrap_or_else(|| self.env.endpoint_url().to_string())
    }

    /// Load configuration from a Java-style properties file.
    ///
    /// Unknown keys are ignored and missing keys keep their defaults.
    /// Durations are given in milliseconds, amounts in halalas.
    ///
    /// ```text
    /// fatoora.env=simulation
    /// fatoora.gateway.clearance.timeout.ms=30000
    /// fatoora.ratelimit.capacity=100
    /// fatoora.retry.max=3
    /// fatoora.clearance.threshold.halalas=100000
    /// ```
    pub fn from_properties(path: &Path) -> Result<Config, ConfigError> {
        let pathbuf = path.to_path_buf();
        let file = File::open(path).map_err(|e| ConfigError::Io {
            path: pathbuf.clone(),
            source: e,
        })?;
        let map = java_properties::read(BufReader::new(file)).map_err(|e| {
            ConfigError::PropertiesRead {
                path: pathbuf.clone(),
                source: e,
            }
        })?;
        Config::from_map(&map)
    }

    pub(crate) fn from_map(map: &HashMap<String, String>) -> Result<Config, ConfigError> {
        let env = match map.get("fatoora.env") {
            Some(value) => EnvironmentType::from_str(value)?,
            None => EnvironmentType::NonProduction,
        };
        let mut config = Config::new(env);

        if let Some(url) = map.get("fatoora.gateway.base.url") {
            config.gateway.base_url = Some(url.trim().to_string());
        }
        if let Some(ms) = parse_key::<u64>(map, "fatoora.gateway.clearance.timeout.ms")? {
            config.gateway.clearance_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key::<u64>(map, "fatoora.gateway.reporting.timeout.ms")? {
            config.gateway.reporting_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key::<u64>(map, "fatoora.gateway.default.timeout.ms")? {
            config.gateway.default_timeout = Duration::from_millis(ms);
        }
        if let Some(lang) = map.get("fatoora.gateway.accept.language") {
            config.gateway.accept_language = lang.trim().to_string();
        }

        if let Some(enabled) = parse_key::<bool>(map, "fatoora.ratelimit.enabled")? {
            config.rate_limit.enabled = enabled;
        }
        if let Some(capacity) = parse_key::<u32>(map, "fatoora.ratelimit.capacity")? {
            config.rate_limit.capacity = capacity;
        }
        if let Some(ms) = parse_key::<u64>(map, "fatoora.ratelimit.window.ms")? {
            config.rate_limit.window = Duration::from_millis(ms);
        }

        if let Some(max) = parse_key::<u32>(map, "fatoora.retry.max")? {
            config.retry.max_retries = max;
        }
        if let Some(ms) = parse_key::<u64>(map, "fatoora.retry.base.delay.ms")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = parse_key::<f64>(map, "fatoora.retry.multiplier")? {
            config.retry.multiplier = multiplier;
        }

        if let Some(secs) = parse_key::<u64>(map, "fatoora.rotation.sweep.interval.secs")? {
            config.rotation.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(days) = parse_key::<i64>(map, "fatoora.rotation.warning.days")? {
            config.rotation.warning_window_days = days;
        }
        if let Some(days) = parse_key::<i64>(map, "fatoora.rotation.default.validity.days")? {
            config.rotation.default_validity_days = days;
        }

        if let Some(halalas) = parse_key::<i64>(map, "fatoora.clearance.threshold.halalas")? {
            config.clearance_threshold = Amount::from_halalas(halalas);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway, scheduler or lifecycle cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        };
        if !(1.0..=MAX_RETRY_MULTIPLIER).contains(&self.retry.multiplier) {
            return invalid("fatoora.retry.multiplier", "must be between 1 and 10");
        }
        if self.retry.base_delay > MAX_RETRY_DELAY {
            return invalid("fatoora.retry.base.delay.ms", "must not exceed 300000");
        }
        if self.rate_limit.window.is_zero() {
            return invalid("fatoora.ratelimit.window.ms", "must be greater than zero");
        }
        if self.rate_limit.enabled && self.rate_limit.capacity == 0 {
            return invalid("fatoora.ratelimit.capacity", "must be greater than zero");
        }
        if self.rotation.sweep_interval.is_zero() {
            return invalid("fatoora.rotation.sweep.interval.secs", "must be greater than zero");
        }
        if self.rotation.warning_window_days < 0 {
            return invalid("fatoora.rotation.warning.days", "must not be negative");
        }
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.rotation.default_validity_days) {
            return invalid(
                "fatoora.rotation.default.validity.days",
                "must be between 1 and 3650",
            );
        }
        Ok(())
    }
}

fn parse_key<T>(map: &HashMap<String, String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match map.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(EnvironmentType::NonProduction)
    }
}
