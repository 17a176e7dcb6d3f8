//! Wiring of a configured backend: the repository plus its job registry.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::{BackendKind, ConfigError, RepositoryConfig};
use crate::registry::{InMemoryJobRegistry, JobRegistry};
use crate::repository::postgres::{self, PostgresExecutionRepository, PostgresJobRegistry};
use crate::repository::{
    CachingExecutionRepository, InMemoryExecutionRepository, JobExecutionRepository, RepositoryError,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A connected (but not yet opened) repository and the registry its jobs
/// must be registered in.
pub struct Backend<T> {
    pub repository: Arc<dyn JobExecutionRepository<T>>,
    pub registry: Arc<dyn JobRegistry>,
}

impl<T> Backend<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build the backend selected by `config`.
    ///
    /// `runtime` drives the async Postgres driver; other backends ignore it.
    pub fn connect(config: &RepositoryConfig, runtime: Handle) -> Result<Self, BackendError> {
        config.validate()?;

        let backend = match config.backend {
            BackendKind::Memory => {
                let registry = Arc::new(InMemoryJobRegistry::new());
                Self {
                    repository: Arc::new(InMemoryExecutionRepository::with_registry(Arc::clone(
                        &registry,
                    ))),
                    registry,
                }
            }
            BackendKind::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or(ConfigError::Missing(crate::config::DATABASE_URL_ENV))?;
                let pool = postgres::block_on(&runtime, async {
                    let pool = PgPool::connect(url).await.map_err(RepositoryError::storage)?;
                    postgres::migrate(&pool).await?;
                    Ok::<_, RepositoryError>(pool)
                })?;
                let pool = Arc::new(pool);
                Self {
                    repository: Arc::new(PostgresExecutionRepository::from_shared(
                        Arc::clone(&pool),
                        runtime.clone(),
                        crate::codec::JsonCodec::new(),
                    )),
                    registry: Arc::new(PostgresJobRegistry::new(pool, runtime)),
                }
            }
            BackendKind::Redis => Self::connect_redis(config)?,
        };

        info!(backend = ?config.backend, cache_ttl = ?config.cache_ttl, "execution repository configured");

        Ok(match config.cache_ttl {
            Some(ttl) => Self {
                repository: Arc::new(CachingExecutionRepository::with_ttl(backend.repository, ttl)),
                registry: backend.registry,
            },
            None => backend,
        })
    }

    #[cfg(feature = "redis")]
    fn connect_redis(config: &RepositoryConfig) -> Result<Self, BackendError> {
        let repository = crate::repository::RedisExecutionRepository::new(
            config.redis_url_or_default(),
            config.redis_prefix.clone(),
        )?;
        Ok(Self {
            registry: Arc::new(repository.registry()),
            repository: Arc::new(repository),
        })
    }

    #[cfg(not(feature = "redis"))]
    fn connect_redis(_config: &RepositoryConfig) -> Result<Self, BackendError> {
        Err(RepositoryError::illegal_state("the redis backend requires the `redis` feature").into())
    }
}
