//! octorun-controller — keeps runner sets at their desired size.
//!
//! # Architecture
//!
//! - [`priority`]: which runners to remove first when scaling down
//! - [`fleet`]: adoption, reaping and the create/delete diff
//! - [`reconciler`]: one level-triggered pass over a single runner set
//! - [`controller`]: work queue, workers, watch mapping and resync
//!
//! All store access goes through [`octorun_state::ObjectStore`], injected
//! at construction, so several controllers can run side by side in tests.

pub mod controller;
pub mod deadline;
pub mod error;
pub mod events;
pub mod fleet;
pub mod priority;
pub mod queue;
pub mod reconciler;

pub use controller::{Controller, ControllerSettings};
pub use deadline::Deadline;
pub use error::{AggregateError, ControllerError, ControllerResult};
pub use events::{EventRecorder, NoopEventRecorder, StoreEventRecorder};
pub use fleet::{FleetEngine, SyncOutcome};
pub use reconciler::{PendingStatus, ReconcileOutcome, Reconciler};
