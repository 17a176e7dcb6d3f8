//! Environment-driven repository configuration.
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `RUNLEDGER_BACKEND` | `memory`, `postgres` or `redis` | `memory` |
//! | `DATABASE_URL` | Postgres connection URL | required for `postgres` |
//! | `REDIS_URL` | Redis connection URL | `redis://localhost:6379` |
//! | `RUNLEDGER_REDIS_PREFIX` | key prefix for the Redis backend | `runledger` |
//! | `RUNLEDGER_CACHE_TTL_SECS` | wrap the backend in a last-success cache | no cache |

use std::time::Duration;

use thiserror::Error;

pub const BACKEND_ENV: &str = "RUNLEDGER_BACKEND";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const REDIS_URL_ENV: &str = "REDIS_URL";
pub const REDIS_PREFIX_ENV: &str = "RUNLEDGER_REDIS_PREFIX";
pub const CACHE_TTL_ENV: &str = "RUNLEDGER_CACHE_TTL_SECS";

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown backend '{0}' (expected memory, postgres or redis)")]
    UnknownBackend(String),

    #[error("{0} must be set for the selected backend")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Memory,
    Postgres,
    Redis,
}

impl core::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "redis" => Ok(BackendKind::Redis),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepositoryConfig {
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_prefix: Option<String>,
    /// `Some` wraps the backend in `CachingExecutionRepository`.
    pub cache_ttl: Option<Duration>,
}

impl RepositoryConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup` (e.g. a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup(BACKEND_ENV) {
            Some(raw) => raw.parse()?,
            None => BackendKind::default(),
        };

        let cache_ttl = lookup(CACHE_TTL_ENV)
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: CACHE_TTL_ENV,
                        value: raw,
                    })
            })
            .transpose()?;

        let config = Self {
            backend,
            database_url: lookup(DATABASE_URL_ENV).filter(|v| !v.is_empty()),
            redis_url: lookup(REDIS_URL_ENV).filter(|v| !v.is_empty()),
            redis_prefix: lookup(REDIS_PREFIX_ENV).filter(|v| !v.is_empty()),
            cache_ttl,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the selected backend has what it needs to connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendKind::Postgres if self.database_url.is_none() => {
                Err(ConfigError::Missing(DATABASE_URL_ENV))
            }
            _ => Ok(()),
        }
    }

    pub fn redis_url_or_default(&self) -> &str {
        self.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL)
    }
}
