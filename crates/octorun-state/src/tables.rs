//! redb table definitions for the octorun state store.
//!
//! Every kind lives in its own table with `&str` keys of the form
//! `{namespace}/{name}` and `&[u8]` values (JSON-serialized objects).

use redb::TableDefinition;

use crate::meta::Resource;
use crate::types::{ControllerRevision, Event, Runner, RunnerSet};

/// Tables created when the store is opened.
pub const ALL_TABLES: &[&str] = &[
    RunnerSet::TABLE,
    Runner::TABLE,
    ControllerRevision::TABLE,
    Event::TABLE,
];

/// Tables scanned for dependents when an owner is deleted.
pub const DEPENDENT_TABLES: &[(&str, &str)] = &[
    (Runner::TABLE, Runner::KIND),
    (ControllerRevision::TABLE, ControllerRevision::KIND),
];

/// Table definition for a table name.
pub fn table(name: &'static str) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Composite key for an object.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
