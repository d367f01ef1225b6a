//! Change notifications published by the state store.

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectKey, OwnerReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A committed mutation of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub event_type: WatchEventType,
    /// Controller owner of the object at the time of the change.
    pub controller: Option<OwnerReference>,
}
