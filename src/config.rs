//! Configuration for the generation orchestrator.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `FORGE_*` environment variables. The generation backend, queue and
//! store implementations are chosen here explicitly, never by inspecting
//! runtime values such as API keys.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::{FallbackPolicy, RegistryConfig};
use crate::progress::ProgressConfig;
use crate::scheduler::state::FailurePolicy;
use crate::scheduler::worker_pool::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Serde helpers for durations expressed in milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Model health tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_ms")]
    pub decay_half_life: Duration,
    #[serde(with = "duration_ms")]
    pub reconcile_interval: Duration,
    #[serde(with = "duration_ms")]
    pub recovery_cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub rate_limit_cooldown: Duration,
    /// Latency assumed for a model with no successful attempts yet.
    pub default_latency_ms: u64,
    /// Models that must all be available for the system to report healthy.
    pub critical_models: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            decay_half_life: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(30),
            recovery_cooldown: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(60),
            default_latency_ms: 30_000,
            critical_models: Vec::new(),
        }
    }
}

/// Job admission and failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_assets: u32,
    pub failure: FailurePolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_assets: 50,
            failure: FailurePolicy::default(),
        }
    }
}

/// Which generation backend serves attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Deterministic fixed-latency backend for tests and dry runs.
    Fixed {
        latency_ms: u64,
        quality_score: f64,
        #[serde(default)]
        unavailable_models: Vec<String>,
    },
    /// HTTP generation service.
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(with = "duration_ms", default = "default_http_timeout")]
        request_timeout: Duration,
    },
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Fixed {
            latency_ms: 200,
            quality_score: 0.85,
            unavailable_models: Vec::new(),
        }
    }
}

/// Where queued tasks live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueConfig {
    #[default]
    Memory,
    Redis { url: String, queue_name: String },
}

/// Where jobs are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres { url: String },
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ForgeConfig {
    pub pool: WorkerPoolConfig,
    pub fallback: FallbackPolicy,
    pub health: HealthConfig,
    pub jobs: JobsConfig,
    pub progress: ProgressConfig,
    pub backend: BackendConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then the YAML file at `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file; missing sections take defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_NUM_WORKERS`: Worker pool size
    /// - `FORGE_ATTEMPT_TIMEOUT_SECS`: Per-attempt backend timeout
    /// - `FORGE_DEFAULT_MODEL`: Model used when a request names none
    /// - `FORGE_FALLBACK_MODELS`: Comma-separated fallback candidates
    /// - `FORGE_MAX_RETRIES`: Retries per task after the first attempt
    /// - `FORGE_FAILURE_THRESHOLD`: Consecutive failures before a model is flagged
    /// - `FORGE_MAX_FAILED_FRACTION`: Failed-task fraction a job tolerates
    /// - `FORGE_COALESCE_INTERVAL_MS`: Minimum gap between progress events per job
    /// - `FORGE_BACKEND_URL` / `FORGE_BACKEND_API_KEY`: Use the HTTP backend
    /// - `FORGE_REDIS_URL`: Use the Redis task queue
    /// - `DATABASE_URL`: Use the PostgreSQL job store
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FORGE_NUM_WORKERS") {
            self.pool.num_workers = parse_env_value(&val, "FORGE_NUM_WORKERS")?;
        }

        if let Some(val) = lookup("FORGE_ATTEMPT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_ATTEMPT_TIMEOUT_SECS")?;
            self.pool.attempt_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FORGE_DEFAULT_MODEL") {
            self.fallback.default_model = val;
        }

        if let Some(val) = lookup("FORGE_FALLBACK_MODELS") {
            self.fallback.candidates = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("FORGE_MAX_RETRIES") {
            self.fallback.max_retries = parse_env_value(&val, "FORGE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("FORGE_FAILURE_THRESHOLD") {
            self.fallback.failure_threshold = parse_env_value(&val, "FORGE_FAILURE_THRESHOLD")?;
        }

        if let Some(val) = lookup("FORGE_MAX_FAILED_FRACTION") {
            self.jobs.failure.max_failed_fraction =
                parse_env_value(&val, "FORGE_MAX_FAILED_FRACTION")?;
        }

        if let Some(val) = lookup("FORGE_COALESCE_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "FORGE_COALESCE_INTERVAL_MS")?;
            self.progress.coalesce_interval = Duration::from_millis(ms);
        }

        if let Some(base_url) = lookup("FORGE_BACKEND_URL") {
            self.backend = BackendConfig::Http {
                base_url,
                api_key: lookup("FORGE_BACKEND_API_KEY"),
                request_timeout: default_http_timeout(),
            };
        }

        if let Some(url) = lookup("FORGE_REDIS_URL") {
            self.queue = QueueConfig::Redis {
                url,
                queue_name: lookup("FORGE_QUEUE_NAME").unwrap_or_else(|| "forge:tasks".into()),
            };
        }

        if let Some(url) = lookup("DATABASE_URL") {
            self.store = StoreConfig::Postgres { url };
        }

        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool.num_workers must be at least 1".to_string(),
            ));
        }

        if self.pool.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "pool.attempt_timeout must be greater than zero".to_string(),
            ));
        }

        if self.pool.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "pool.poll_interval must be greater than zero".to_string(),
            ));
        }

        if self.pool.store_backoff_base.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "pool.store_backoff_base must be greater than zero".to_string(),
            ));
        }

        if self.health.reconcile_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "health.reconcile_interval must be greater than zero".to_string(),
            ));
        }

        if self.fallback.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "fallback.default_model must not be empty".to_string(),
            ));
        }

        if self.fallback.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "fallback.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.fallback.backoff.base > self.fallback.backoff.cap {
            return Err(ConfigError::ValidationFailed(
                "fallback.backoff.base must not exceed fallback.backoff.cap".to_string(),
            ));
        }

        let fraction = self.jobs.failure.max_failed_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::ValidationFailed(format!(
                "jobs.failure.max_failed_fraction must be in [0, 1], got {}",
                fraction
            )));
        }

        if self.jobs.max_assets == 0 {
            return Err(ConfigError::ValidationFailed(
                "jobs.max_assets must be at least 1".to_string(),
            ));
        }

        if let BackendConfig::Fixed { quality_score, .. } = &self.backend {
            if !(0.0..=1.0).contains(quality_score) {
                return Err(ConfigError::ValidationFailed(
                    "backend.quality_score must be in [0, 1]".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Registry tuning derived from the fallback and health sections.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            failure_threshold: self.fallback.failure_threshold,
            decay_half_life: self.health.decay_half_life,
            recovery_cooldown: self.health.recovery_cooldown,
            rate_limit_cooldown: self.health.rate_limit_cooldown,
        }
    }

    /// Critical models for health reporting; the default model is always included.
    pub fn critical_models(&self) -> Vec<String> {
        let mut models = vec![self.fallback.default_model.clone()];
        for model in &self.health.critical_models {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        models
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ForgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.num_workers, 4);
        assert_eq!(config.pool.attempt_timeout, Duration::from_secs(60));
        assert_eq!(config.progress.coalesce_interval, Duration::from_millis(250));
        assert_eq!(config.jobs.failure.max_failed_fraction, 0.0);
        assert!(matches!(config.backend, BackendConfig::Fixed { .. }));
        assert_eq!(config.queue, QueueConfig::Memory);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ForgeConfig::default();
        config
            .apply_env(lookup_from(&[
                ("FORGE_NUM_WORKERS", "8"),
                ("FORGE_DEFAULT_MODEL", "veo"),
                ("FORGE_FALLBACK_MODELS", "kling, runway,,"),
                ("FORGE_MAX_FAILED_FRACTION", "0.5"),
                ("FORGE_REDIS_URL", "redis://cache:6379"),
                ("DATABASE_URL", "postgres://db/forge"),
            ]))
            .expect("env should apply");

        assert_eq!(config.pool.num_workers, 8);
        assert_eq!(config.fallback.default_model, "veo");
        assert_eq!(config.fallback.candidates, vec!["kling", "runway"]);
        assert_eq!(config.jobs.failure.max_failed_fraction, 0.5);
        assert_eq!(
            config.queue,
            QueueConfig::Redis {
                url: "redis://cache:6379".into(),
                queue_name: "forge:tasks".into(),
            }
        );
        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                url: "postgres://db/forge".into()
            }
        );
    }

    #[test]
    fn test_env_invalid_value() {
        let mut config = ForgeConfig::default();
        let err = config
            .apply_env(lookup_from(&[("FORGE_NUM_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("FORGE_NUM_WORKERS"));
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = ForgeConfig::default();
        config.jobs.failure.max_failed_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ForgeConfig::default();
        config.pool.num_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = ForgeConfig::default();
        config.health.reconcile_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("reconcile_interval")
        ));

        let mut config = ForgeConfig::default();
        config.pool.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("poll_interval")
        ));

        let mut config = ForgeConfig::default();
        config.pool.store_backoff_base = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("store_backoff_base")
        ));
    }

    #[test]
    fn test_yaml_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
pool:
  num_workers: 2
fallback:
  default_model: m1
  candidates: [m2, m3]
backend:
  kind: fixed
  latency_ms: 5
  quality_score: 0.7
  unavailable_models: [m1]
"#
        )
        .expect("write");

        let config = ForgeConfig::from_yaml_file(file.path()).expect("parse");
        assert_eq!(config.pool.num_workers, 2);
        assert_eq!(config.pool.attempt_timeout, Duration::from_secs(60));
        assert_eq!(config.fallback.candidates, vec!["m2", "m3"]);
        assert_eq!(config.fallback.max_retries, 3);
        assert_eq!(
            config.backend,
            BackendConfig::Fixed {
                latency_ms: 5,
                quality_score: 0.7,
                unavailable_models: vec!["m1".into()],
            }
        );
    }

    #[test]
    fn test_critical_models_include_default() {
        let mut config = ForgeConfig::default();
        config.fallback.default_model = "m1".into();
        config.health.critical_models = vec!["m2".into(), "m1".into()];
        assert_eq!(config.critical_models(), vec!["m1", "m2"]);
    }
}
