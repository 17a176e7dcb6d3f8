//! `runledger-core` - value types of the job execution ledger.
//!
//! This crate contains **pure** types (no storage concerns): identifiers,
//! execution keys, the execution state sum type and failure rendering.

pub mod error;
pub mod execution;
pub mod failure;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use execution::{
    ExecutionKey, ExecutionState, Failure, JobExecution, JobExecutionVisitor, Started, Success,
};
pub use failure::render_error;
pub use id::{JobId, OrganizationId};
