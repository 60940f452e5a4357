//! Process configuration from `TOKENMILL_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tokenmill_core::FeatureCatalog;

use crate::jobs::{RetryPolicy, SubmitConfig, WorkerConfig};
use crate::reaper::ReaperConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to load feature catalog from {path}: {reason}")]
    Catalog { path: String, reason: String },
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub webhook_secret: String,
    /// Postgres store when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Redis Streams queue when set and the `redis` feature is on.
    pub redis_url: Option<String>,
    pub workers: usize,
    pub pop_timeout: Duration,
    pub reaper_interval: Duration,
    pub stale_after: Duration,
    pub requeue_after: Duration,
    pub sweep_batch: usize,
    pub generator_url: String,
    pub generator_timeout: Duration,
    pub max_prompt_chars: usize,
    pub log_format: String,
    pub feature_catalog: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: "dev-secret".to_string(),
            webhook_secret: "dev-webhook-secret".to_string(),
            database_url: None,
            database_max_connections: 10,
            redis_url: None,
            workers: 4,
            pop_timeout: Duration::from_secs(2),
            reaper_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(15 * 60),
            requeue_after: Duration::from_secs(5 * 60),
            sweep_batch: 100,
            generator_url: "http://127.0.0.1:9000/generate".to_string(),
            generator_timeout: Duration::from_secs(600),
            max_prompt_chars: 4000,
            log_format: "json".to_string(),
            feature_catalog: None,
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database", &self.database_url.is_some())
            .field("redis", &self.redis_url.is_some())
            .field("workers", &self.workers)
            .field("reaper_interval", &self.reaper_interval)
            .field("stale_after", &self.stale_after)
            .field("generator_url", &self.generator_url)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("TOKENMILL_BIND") {
            cfg.bind_addr = parse("TOKENMILL_BIND", v)?;
        }
        if let Some(v) = get("TOKENMILL_JWT_SECRET") {
            cfg.jwt_secret = v;
        }
        if let Some(v) = get("TOKENMILL_WEBHOOK_SECRET") {
            cfg.webhook_secret = v;
        }
        cfg.database_url = get("DATABASE_URL");
        if let Some(v) = get("TOKENMILL_DB_MAX_CONNECTIONS") {
            cfg.database_max_connections = positive("TOKENMILL_DB_MAX_CONNECTIONS", v)?;
        }
        cfg.redis_url = get("REDIS_URL");
        if let Some(v) = get("TOKENMILL_WORKERS") {
            cfg.workers = positive("TOKENMILL_WORKERS", v)?;
        }
        if let Some(v) = get("TOKENMILL_POP_TIMEOUT_MS") {
            cfg.pop_timeout = duration("TOKENMILL_POP_TIMEOUT_MS", v, Duration::from_millis)?;
        }
        if let Some(v) = get("TOKENMILL_REAPER_INTERVAL_SECS") {
            cfg.reaper_interval =
                duration("TOKENMILL_REAPER_INTERVAL_SECS", v, Duration::from_secs)?;
        }
        if let Some(v) = get("TOKENMILL_STALE_AFTER_SECS") {
            cfg.stale_after = duration("TOKENMILL_STALE_AFTER_SECS", v, Duration::from_secs)?;
        }
        if let Some(v) = get("TOKENMILL_REQUEUE_AFTER_SECS") {
            cfg.requeue_after = duration("TOKENMILL_REQUEUE_AFTER_SECS", v, Duration::from_secs)?;
        }
        if let Some(v) = get("TOKENMILL_SWEEP_BATCH") {
            cfg.sweep_batch = positive("TOKENMILL_SWEEP_BATCH", v)?;
        }
        if let Some(v) = get("TOKENMILL_GENERATOR_URL") {
            cfg.generator_url = v;
        }
        if let Some(v) = get("TOKENMILL_GENERATOR_TIMEOUT_SECS") {
            cfg.generator_timeout =
                duration("TOKENMILL_GENERATOR_TIMEOUT_SECS", v, Duration::from_secs)?;
        }
        if let Some(v) = get("TOKENMILL_MAX_PROMPT_CHARS") {
            cfg.max_prompt_chars = positive("TOKENMILL_MAX_PROMPT_CHARS", v)?;
        }
        if let Some(v) = get("TOKENMILL_LOG_FORMAT") {
            cfg.log_format = v;
        }
        cfg.feature_catalog = get("TOKENMILL_FEATURE_CATALOG").map(PathBuf::from);

        Ok(cfg)
    }

    /// The configured catalog file, or the built-in catalog.
    pub fn load_catalog(&self) -> Result<FeatureCatalog, ConfigError> {
        let Some(path) = &self.feature_catalog else {
            return Ok(FeatureCatalog::default());
        };
        let catalog_err = |reason: String| ConfigError::Catalog {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| catalog_err(e.to_string()))?;
        let parsed: FeatureCatalog =
            serde_json::from_str(&raw).map_err(|e| catalog_err(e.to_string()))?;
        FeatureCatalog::new(parsed.features).map_err(|e| catalog_err(e.to_string()))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_workers(self.workers)
            .with_pop_timeout(self.pop_timeout)
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            stale_after: to_chrono(self.stale_after),
            requeue_after: to_chrono(self.requeue_after),
            batch_size: self.sweep_batch,
        }
    }

    pub fn submit_config(&self) -> SubmitConfig {
        SubmitConfig {
            max_prompt_chars: self.max_prompt_chars,
            dispatch_policy: RetryPolicy::default(),
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: format!("{e}"),
            value,
        }),
    }
}

fn positive<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(var, value.clone())?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

/// Upper bound for every configured duration.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn duration(
    var: &'static str,
    value: String,
    unit: fn(u64) -> Duration,
) -> Result<Duration, ConfigError> {
    let parsed = unit(positive(var, value.clone())?);
    if parsed > MAX_DURATION {
        return Err(ConfigError::Invalid {
            var,
            value,
            reason: "must not exceed one year".to_string(),
        });
    }
    Ok(parsed)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.reaper_config().stale_after, chrono::Duration::minutes(15));
        assert_eq!(cfg.load_catalog().unwrap(), FeatureCatalog::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("TOKENMILL_BIND", "127.0.0.1:9999"),
            ("TOKENMILL_WORKERS", "8"),
            ("TOKENMILL_STALE_AFTER_SECS", "60"),
            ("DATABASE_URL", "postgres://localhost/tokenmill"),
            ("REDIS_URL", "  "),
        ])
        .unwrap();

        assert_eq!(cfg.bind_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(cfg.worker_config().workers, 8);
        assert_eq!(cfg.reaper_config().stale_after, chrono::Duration::seconds(60));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/tokenmill"));
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(
            config(&[("TOKENMILL_WORKERS", "many")]),
            Err(ConfigError::Invalid { var: "TOKENMILL_WORKERS", .. })
        ));
        assert!(matches!(
            config(&[("TOKENMILL_WORKERS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(config(&[("TOKENMILL_BIND", "nowhere")]).is_err());
    }

    #[test]
    fn durations_beyond_a_year_are_rejected() {
        assert!(matches!(
            config(&[("TOKENMILL_STALE_AFTER_SECS", "100000000000000")]),
            Err(ConfigError::Invalid { var: "TOKENMILL_STALE_AFTER_SECS", .. })
        ));
        assert!(config(&[("TOKENMILL_POP_TIMEOUT_MS", "99999999999999")]).is_err());

        let year = config(&[("TOKENMILL_REQUEUE_AFTER_SECS", "31536000")]).unwrap();
        assert_eq!(year.reaper_config().requeue_after, chrono::Duration::days(365));
    }

    #[test]
    fn missing_catalog_file_is_an_error() {
        let cfg = config(&[("TOKENMILL_FEATURE_CATALOG", "/nonexistent/catalog.json")]).unwrap();
        assert!(matches!(cfg.load_catalog(), Err(ConfigError::Catalog { .. })));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cfg = config(&[("TOKENMILL_JWT_SECRET", "hunter2")]).unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
