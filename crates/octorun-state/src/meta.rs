//! Object metadata shared by every persisted kind.
//!
//! Ownership is a back-edge: an object stores its owner's kind, name and
//! UID, and the owner finds its dependents by querying the store. There
//! are no in-memory links between objects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Standard metadata carried by every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Prefix used by the store to generate a unique name when `name` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    /// Bumped by the store on every write; checked by `update`.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Non-empty once the object is pending removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Reference from a dependent object to its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Reference to an object, used as the subject of events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectMeta {
    /// Convenience constructor for a named object in a namespace.
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_of(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    /// Whether the object's controller is the object with the given UID.
    pub fn is_controlled_by(&self, owner_uid: &str) -> bool {
        self.controller_of().is_some_and(|r| r.uid == owner_uid)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

/// A kind that the state store can persist.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;
    const API_VERSION: &'static str;
    /// redb table holding objects of this kind.
    const TABLE: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    fn uid(&self) -> &str {
        &self.meta().uid
    }

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    /// Reference suitable for pointing events at this object.
    fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            kind: Self::KIND.to_string(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
        }
    }

    /// Owner reference naming this object as the controller of a dependent.
    fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Make `owner` the controller of `dependent`.
///
/// Fails when the dependent already has a different controller; ownership
/// is never taken over. Setting the same controller twice is a no-op.
pub fn set_controller_reference<O: Resource, D: Resource>(
    owner: &O,
    dependent: &mut D,
) -> StateResult<()> {
    if owner.uid().is_empty() {
        return Err(StateError::Invalid(format!(
            "{} {} has no uid and cannot own objects",
            O::KIND,
            owner.key()
        )));
    }
    let key = dependent.key().to_string();
    let meta = dependent.meta_mut();
    if let Some(existing) = meta.controller_of() {
        if existing.uid == owner.uid() {
            return Ok(());
        }
        return Err(StateError::AlreadyOwned {
            kind: D::KIND,
            key,
            owner_kind: existing.kind.clone(),
            owner: existing.name.clone(),
        });
    }
    meta.owner_references.retain(|r| r.uid != owner.uid());
    meta.owner_references.push(owner.controller_ref());
    Ok(())
}

/// `namespace/name` identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(StateError::Invalid(format!(
                "object key must be namespace/name, got {s:?}"
            ))),
        }
    }
}
