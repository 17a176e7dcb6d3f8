//! Job execution repository boundary and its backends.
//!
//! [`JobExecutionRepository`] is the storage-agnostic contract. Backends:
//!
//! - [`InMemoryExecutionRepository`]: reference backend for tests/dev
//! - [`PostgresExecutionRepository`]: transactional upsert per transition
//! - `RedisExecutionRepository` (feature `redis`): last-write-wins rows
//! - [`CachingExecutionRepository`]: decorator caching each job's last success

pub mod caching;
pub mod in_memory;
pub mod lifecycle;
pub mod postgres;
pub mod record;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use caching::CachingExecutionRepository;
pub use in_memory::InMemoryExecutionRepository;
pub use lifecycle::Lifecycle;
pub use postgres::{PostgresExecutionRepository, PostgresJobRegistry};
pub use record::{ExecutionRecord, Transition};
#[cfg(feature = "redis")]
pub use self::redis::{RedisExecutionRepository, RedisJobRegistry};
pub use r#trait::{JobExecutionRepository, RepositoryError, RepositoryResult};
