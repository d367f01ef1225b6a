//! Deletion priority for scale-down.
//!
//! Each runner gets a numeric score, higher meaning "delete first":
//! - **MUST_DELETE**: already pending removal
//! - **COULD_DELETE**: idle or in a phase we don't know
//! - **MUST_NOT_DELETE**: busy running a job

use std::cmp::Reverse;

use octorun_state::{Runner, RunnerPhase};

pub const MUST_DELETE: u32 = 100;
pub const COULD_DELETE: u32 = 50;
pub const MUST_NOT_DELETE: u32 = 0;

pub fn deletion_priority(runner: &Runner) -> u32 {
    if runner.metadata.is_deleting() {
        return MUST_DELETE;
    }
    match runner.status.phase {
        RunnerPhase::Active => MUST_NOT_DELETE,
        _ => COULD_DELETE,
    }
}

/// Runners ordered by descending deletion priority. Runners with equal
/// priority keep their input order.
pub fn prioritize_for_deletion(runners: &[Runner]) -> Vec<&Runner> {
    let mut ordered: Vec<&Runner> = runners.iter().collect();
    ordered.sort_by_key(|r| Reverse(deletion_priority(r)));
    ordered
}

/// The `count` runners to delete first.
pub fn select_for_deletion(runners: &[Runner], count: usize) -> Vec<&Runner> {
    let mut ordered = prioritize_for_deletion(runners);
    ordered.truncate(count);
    ordered
}
