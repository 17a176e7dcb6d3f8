//! Tracing and logging setup shared by every process embedding the ledger.

/// Initialize process-wide observability (tracing/logging).
///
/// The output format is taken from `LOG_FORMAT` (see [`tracing::LogFormat`]).
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::LogFormat;
