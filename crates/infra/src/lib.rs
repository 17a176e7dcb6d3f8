//! Infrastructure layer: execution repositories, backends, config and wiring.

pub mod backend;
pub mod codec;
pub mod config;
pub mod registry;
pub mod repository;
pub mod tracker;

#[cfg(any(test, feature = "conformance"))]
pub mod conformance;

#[cfg(test)]
mod integration_tests;

pub use backend::{Backend, BackendError};
pub use codec::{CodecError, JsonCodec, ResultCodec};
pub use config::{BackendKind, ConfigError, RepositoryConfig};
pub use registry::{InMemoryJobRegistry, JobRegistry};
pub use repository::{
    CachingExecutionRepository, InMemoryExecutionRepository, JobExecutionRepository,
    PostgresExecutionRepository, PostgresJobRegistry, RepositoryError, RepositoryResult,
};
pub use tracker::ExecutionTracker;
