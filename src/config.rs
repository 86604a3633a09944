//! Configuration types.
//!
//! Everything is read from `DOC_ROUTER_*` environment variables with
//! defaults suitable for local development. Malformed values are rejected
//! rather than silently replaced by defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default Gemini model for the LLM oracle.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Router and worker-pool tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum tasks processed concurrently.
    pub workers: usize,
    /// Capacity of the submit queue feeding the worker pool.
    pub queue_capacity: usize,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Upper bound on a single store call.
    pub store_timeout: Duration,
    /// Upper bound on a single oracle call.
    pub oracle_timeout: Duration,
    /// Below this confidence the intent is downgraded to Unknown.
    pub confidence_threshold: f32,
    /// CAS attempts before a task is failed with InternalError.
    pub max_cas_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            handler_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
            oracle_timeout: Duration::from_secs(15),
            confidence_threshold: 0.5,
            max_cas_attempts: 5,
        }
    }
}

/// Which correlation store backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    LibSql { path: PathBuf },
    Redis { url: String, prefix: String },
}

/// Inference oracle settings.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// When absent the rule-based oracle is used.
    pub gemini_api_key: Option<secrecy::SecretString>,
    pub model: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Whole-service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub port: u16,
    pub store: StoreBackend,
    pub router: RouterConfig,
    pub oracle: OracleConfig,
    /// Directory for daily-rolling log files; stdout only when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8090,
            store: StoreBackend::Memory,
            router: RouterConfig::default(),
            oracle: OracleConfig::default(),
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let router_defaults = RouterConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store = match get("DOC_ROUTER_STORE").as_deref().map(str::trim) {
            None | Some("memory") => StoreBackend::Memory,
            Some("libsql") | Some("sqlite") => StoreBackend::LibSql {
                path: get("DOC_ROUTER_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/doc-router.db")),
            },
            Some("redis") => StoreBackend::Redis {
                url: get("DOC_ROUTER_REDIS_URL").ok_or_else(|| ConfigError::MissingRequired {
                    key: "DOC_ROUTER_REDIS_URL".into(),
                    hint: "Set it to redis://host:port when DOC_ROUTER_STORE=redis".into(),
                })?,
                prefix: get("DOC_ROUTER_REDIS_PREFIX").unwrap_or_else(|| "doc-router".into()),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "DOC_ROUTER_STORE".into(),
                    message: format!("expected memory, libsql or redis, got '{other}'"),
                });
            }
        };

        let router = RouterConfig {
            workers: parse_or(&get, "DOC_ROUTER_WORKERS", router_defaults.workers)?,
            queue_capacity: parse_or(&get, "DOC_ROUTER_QUEUE_CAPACITY", router_defaults.queue_capacity)?,
            handler_timeout: secs_or(&get, "DOC_ROUTER_HANDLER_TIMEOUT_SECS", router_defaults.handler_timeout)?,
            store_timeout: secs_or(&get, "DOC_ROUTER_STORE_TIMEOUT_SECS", router_defaults.store_timeout)?,
            oracle_timeout: secs_or(&get, "DOC_ROUTER_ORACLE_TIMEOUT_SECS", router_defaults.oracle_timeout)?,
            confidence_threshold: parse_or(
                &get,
                "DOC_ROUTER_CONFIDENCE_THRESHOLD",
                router_defaults.confidence_threshold,
            )?,
            max_cas_attempts: parse_or(&get, "DOC_ROUTER_MAX_CAS_ATTEMPTS", router_defaults.max_cas_attempts)?,
        };

        if router.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOC_ROUTER_WORKERS".into(),
                message: "must be at least 1".into(),
            });
        }
        if router.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DOC_ROUTER_QUEUE_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&router.confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "DOC_ROUTER_CONFIDENCE_THRESHOLD".into(),
                message: "must be between 0.0 and 1.0".into(),
            });
        }

        let oracle = OracleConfig {
            gemini_api_key: get("GEMINI_API_KEY").map(secrecy::SecretString::from),
            model: get("DOC_ROUTER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        };

        Ok(Self {
            bind_addr: get("DOC_ROUTER_BIND").unwrap_or(defaults.bind_addr),
            port: parse_or(&get, "DOC_ROUTER_PORT", defaults.port)?,
            store,
            router,
            oracle,
            log_dir: get("DOC_ROUTER_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(get, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8090);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.router.workers, 8);
        assert_eq!(config.router.max_cas_attempts, 5);
        assert!(config.oracle.gemini_api_key.is_none());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn libsql_backend_with_path() {
        let config = load(&[("DOC_ROUTER_STORE", "libsql"), ("DOC_ROUTER_DB_PATH", "/tmp/x.db")]).unwrap();
        assert_eq!(
            config.store,
            StoreBackend::LibSql {
                path: PathBuf::from("/tmp/x.db")
            }
        );
    }

    #[test]
    fn redis_backend_requires_url() {
        let err = load(&[("DOC_ROUTER_STORE", "redis")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));

        let config = load(&[
            ("DOC_ROUTER_STORE", "redis"),
            ("DOC_ROUTER_REDIS_URL", "redis://localhost:6379"),
        ])
        .unwrap();
        assert!(matches!(config.store, StoreBackend::Redis { ref prefix, .. } if prefix == "doc-router"));
    }

    #[test]
    fn unknown_backend_rejected() {
        let err = load(&[("DOC_ROUTER_STORE", "mongo")]).unwrap_err();
        assert!(err.to_string().contains("DOC_ROUTER_STORE"));
    }

    #[test]
    fn bad_numbers_are_errors_not_defaults() {
        let err = load(&[("DOC_ROUTER_WORKERS", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DOC_ROUTER_WORKERS"));

        let err = load(&[("DOC_ROUTER_CONFIDENCE_THRESHOLD", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = load(&[("DOC_ROUTER_HANDLER_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn timeouts_and_key() {
        let config = load(&[
            ("DOC_ROUTER_HANDLER_TIMEOUT_SECS", "3"),
            ("GEMINI_API_KEY", "g-key"),
            ("DOC_ROUTER_MODEL", "gemini-test"),
        ])
        .unwrap();
        assert_eq!(config.router.handler_timeout, Duration::from_secs(3));
        assert_eq!(
            config.oracle.gemini_api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("g-key".to_string())
        );
        assert_eq!(config.oracle.model, "gemini-test");
    }

    #[test]
    fn debug_output_redacts_key() {
        let config = load(&[("GEMINI_API_KEY", "super-secret")]).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
