//! octorun-state — object model and embedded state store for octorun.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for runner sets, runners, controller revisions and events.
//!
//! # Architecture
//!
//! Every object carries [`ObjectMeta`]: identity, labels, owner references
//! and an optimistic-concurrency resource version. Objects are
//! JSON-serialized into redb's `&[u8]` value columns under
//! `{namespace}/{name}` keys, one table per kind.
//!
//! The controller talks to the store through the [`ObjectStore`] trait so
//! that tests can wrap the real store. `StateStore` is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`) and publishes every committed change
//! as a [`WatchEvent`].

pub mod error;
pub mod meta;
pub mod patch;
pub mod selector;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use error::{IgnoreNotFound, StateError, StateResult};
pub use meta::{
    ObjectKey, ObjectMeta, ObjectReference, OwnerReference, Resource, set_controller_reference,
};
pub use patch::merge_patch;
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
pub use store::{ObjectStore, StateStore};
pub use types::*;
pub use watch::{WatchEvent, WatchEventType};
