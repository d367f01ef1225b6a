//! octorun-history — content-addressed revision history for runner sets.
//!
//! Every distinct runner template is stored once as a `ControllerRevision`
//! named after the fingerprint of its payload. Returning to a template
//! seen before promotes the existing revision instead of duplicating it.

pub mod codec;
pub mod error;
pub mod hash;
pub mod history;

pub use error::{HistoryError, HistoryResult};
pub use hash::fingerprint;
pub use history::{
    CurrentRevision, REVISION_HASH_LABEL, RevisionHistory, RevisionOutcome, sort_revisions,
};
