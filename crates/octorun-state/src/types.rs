//! Domain types for the octorun state store.
//!
//! These types represent the persisted state of runner sets, runners,
//! controller revisions and events. All types serialize to/from JSON for
//! storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, ObjectReference, Resource};
use crate::selector::LabelSelector;

/// API group/version shared by octorun kinds.
pub const GROUP_VERSION: &str = "octorun.github.io/v1alpha2";

// ── RunnerSet ─────────────────────────────────────────────────────

/// Declarative desired state for a replicated set of runners.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerSet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RunnerSetSpec,
    #[serde(default)]
    pub status: RunnerSetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    /// Desired number of runners.
    #[serde(default = "default_runners")]
    pub runners: u32,
    /// Label query over runners that count towards this set.
    #[serde(default)]
    pub selector: LabelSelector,
    /// Template for new runners.
    #[serde(default)]
    pub template: RunnerTemplate,
}

fn default_runners() -> u32 {
    1
}

impl Default for RunnerSetSpec {
    fn default() -> Self {
        Self {
            runners: default_runners(),
            selector: LabelSelector::default(),
            template: RunnerTemplate::default(),
        }
    }
}

/// Runner template: metadata stamped onto each runner plus an opaque spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    /// Opaque runner spec, copied verbatim into each runner.
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Observed state of a runner set, written by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetStatus {
    /// Runners currently counted towards the set.
    #[serde(default)]
    pub runners: u32,
    #[serde(default)]
    pub idle_runners: u32,
    #[serde(default)]
    pub active_runners: u32,
    /// Canonical string form of the spec selector.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    /// Name of the controller revision describing the current template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,
    /// Salt for revision fingerprints, bumped on hash collisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl Resource for RunnerSet {
    const KIND: &'static str = "RunnerSet";
    const API_VERSION: &'static str = GROUP_VERSION;
    const TABLE: &'static str = "runnersets";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── Runner ────────────────────────────────────────────────────────

/// A single managed replica.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Runner {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: RunnerStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunnerStatus {
    #[serde(default)]
    pub phase: RunnerPhase,
}

/// Lifecycle phase of a runner, driven by the runner itself.
///
/// Phases this controller does not know about are kept verbatim in
/// `Other` and are neither counted as idle nor as active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunnerPhase {
    #[default]
    Idle,
    Active,
    Complete,
    Other(String),
}

impl RunnerPhase {
    pub fn as_str(&self) -> &str {
        match self {
            RunnerPhase::Idle => "Idle",
            RunnerPhase::Active => "Active",
            RunnerPhase::Complete => "Complete",
            RunnerPhase::Other(s) => s,
        }
    }
}

impl From<String> for RunnerPhase {
    fn from(s: String) -> Self {
        match s.as_str() {
            // An empty phase is a runner nobody has picked up yet.
            "" | "Idle" => RunnerPhase::Idle,
            "Active" => RunnerPhase::Active,
            "Complete" => RunnerPhase::Complete,
            _ => RunnerPhase::Other(s),
        }
    }
}

impl From<RunnerPhase> for String {
    fn from(phase: RunnerPhase) -> Self {
        match phase {
            RunnerPhase::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Resource for Runner {
    const KIND: &'static str = "Runner";
    const API_VERSION: &'static str = GROUP_VERSION;
    const TABLE: &'static str = "runners";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── ControllerRevision ────────────────────────────────────────────

/// Immutable snapshot of a runner set template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerRevision {
    pub metadata: ObjectMeta,
    /// Restorable patch of the owner's template subtree.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Monotonic per-owner revision number.
    #[serde(default)]
    pub revision: i64,
}

impl ControllerRevision {
    /// Canonical byte form of `data`, the input to fingerprinting.
    pub fn payload(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail: keys are always strings.
        serde_json::to_vec(&self.data).unwrap_or_default()
    }
}

impl Resource for ControllerRevision {
    const KIND: &'static str = "ControllerRevision";
    const API_VERSION: &'static str = "apps/v1";
    const TABLE: &'static str = "controllerrevisions";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ── Event ─────────────────────────────────────────────────────────

/// User-facing notification about an object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: Option<ObjectReference>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    /// Component that emitted the event.
    #[serde(default)]
    pub source: String,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

impl Resource for Event {
    const KIND: &'static str = "Event";
    const API_VERSION: &'static str = "v1";
    const TABLE: &'static str = "events";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
