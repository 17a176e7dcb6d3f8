//! Two-state open/closed guard shared by every repository.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::r#trait::{RepositoryError, RepositoryResult};

/// Tracks whether a repository is open.
///
/// Repositories start closed. `open` and `close` use compare-and-swap so two
/// racing `open()` calls cannot both succeed.
#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    open: AtomicBool,
}

impl Lifecycle {
    /// A closed lifecycle for the repository called `name` (used in errors/logs).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) -> RepositoryResult<()> {
        self.transition(false, true)?;
        debug!(repository = self.name, "opened");
        Ok(())
    }

    pub fn close(&self) -> RepositoryResult<()> {
        self.transition(true, false)?;
        debug!(repository = self.name, "closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Fail with `IllegalState` unless the repository is open.
    pub fn ensure_open(&self) -> RepositoryResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.not_in_state(true))
        }
    }

    fn transition(&self, from: bool, to: bool) -> RepositoryResult<()> {
        self.open
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| self.not_in_state(from))
    }

    fn not_in_state(&self, expected_open: bool) -> RepositoryError {
        RepositoryError::illegal_state(format!(
            "{} is not {}",
            self.name,
            if expected_open { "open" } else { "closed" }
        ))
    }
}
