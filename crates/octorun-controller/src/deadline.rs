//! Reconciliation deadlines.
//!
//! Store calls are blocking, so a deadline cannot interrupt one. It is
//! checked between phases and before every create or delete instead.

use std::time::{Duration, Instant};

use octorun_state::ObjectKey;

use crate::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub fn check(&self, key: &ObjectKey) -> ControllerResult<()> {
        if self.is_expired() {
            return Err(ControllerError::DeadlineExceeded(key.to_string()));
        }
        Ok(())
    }
}
