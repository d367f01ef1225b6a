//! StateStore — redb-backed object store for octorun.
//!
//! Provides typed get/list/create/update/patch/delete over every
//! [`Resource`] kind. Values are JSON-serialized into redb's `&[u8]`
//! value columns. Writes are optimistic: `update` only succeeds against
//! the resource version it was read at. Every committed mutation is
//! published on a broadcast channel for watchers.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::meta::{ObjectMeta, Resource};
use crate::patch::merge_patch;
use crate::selector::LabelSelector;
use crate::tables::*;
use crate::watch::{WatchEvent, WatchEventType};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Alphabet for generated name suffixes (no vowels, no look-alikes).
const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;
const NAME_ATTEMPTS: usize = 8;
const WATCH_CAPACITY: usize = 1024;

/// Operations the controller needs from the cluster state store.
///
/// `StateStore` is the production implementation; tests wrap it to
/// inject failures.
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// Fetch one object; `NotFound` if absent.
    fn get<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<R>;

    /// All objects of a kind in a namespace whose labels match `selector`.
    fn list<R: Resource>(&self, namespace: &str, selector: &LabelSelector)
    -> StateResult<Vec<R>>;

    /// Persist a new object, assigning uid, resource version and timestamps.
    fn create<R: Resource>(&self, obj: &R) -> StateResult<R>;

    /// Replace an object; `Conflict` unless `obj` carries the stored resource version.
    fn update<R: Resource>(&self, obj: &R) -> StateResult<R>;

    /// Apply a JSON merge patch to the stored object.
    fn patch<R: Resource>(&self, namespace: &str, name: &str, patch: &Value) -> StateResult<R>;

    /// Remove an object and its dependents; `NotFound` if absent.
    fn delete<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<()>;

    /// Every object of a kind across all namespaces.
    fn list_all<R: Resource>(&self) -> StateResult<Vec<R>>;

    /// Subscribe to committed mutations.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

/// Just enough of any object to follow owner references.
#[derive(Deserialize)]
struct Envelope {
    metadata: ObjectMeta,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for name in ALL_TABLES {
            txn.open_table(table(name)).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn publish<R: Resource>(&self, obj: &R, event_type: WatchEventType) {
        // No subscribers is not an error.
        let _ = self.events.send(WatchEvent {
            kind: R::KIND.to_string(),
            key: obj.key(),
            event_type,
            controller: obj.meta().controller_of().cloned(),
        });
    }

    /// Pick a free name for `prefix` inside an open write transaction.
    fn generate_name(txn: &WriteTransaction, table_name: &'static str, namespace: &str, prefix: &str) -> StateResult<String> {
        let table = txn.open_table(table(table_name)).map_err(map_err!(Table))?;
        for _ in 0..NAME_ATTEMPTS {
            let candidate = format!("{prefix}{}", random_suffix());
            let taken = table
                .get(object_key(namespace, &candidate).as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !taken {
                return Ok(candidate);
            }
        }
        Err(StateError::AlreadyExists {
            kind: "name",
            key: format!("{namespace}/{prefix}*"),
        })
    }

    /// Remove every object whose owner references point at `owner_uid`.
    fn delete_dependents(&self, txn: &WriteTransaction, owner_uid: &str) -> StateResult<Vec<WatchEvent>> {
        let mut removed = Vec::new();
        for &(table_name, kind) in DEPENDENT_TABLES {
            let mut table = txn.open_table(table(table_name)).map_err(map_err!(Table))?;
            let mut doomed = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let envelope: Envelope =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if envelope
                    .metadata
                    .owner_references
                    .iter()
                    .any(|r| r.uid == owner_uid)
                {
                    doomed.push((key.value().to_string(), envelope.metadata));
                }
            }
            for (key, meta) in doomed {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                removed.push(WatchEvent {
                    kind: kind.to_string(),
                    key: meta.key(),
                    event_type: WatchEventType::Deleted,
                    controller: meta.controller_of().cloned(),
                });
            }
        }
        Ok(removed)
    }
}

impl ObjectStore for StateStore {
    fn get<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<R> {
        let key = object_key(namespace, name);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(StateError::NotFound { kind: R::KIND, key }),
        }
    }

    fn list<R: Resource>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<R>> {
        let prefix = format!("{namespace}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let obj: R = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if selector.matches(&obj.meta().labels) {
                results.push(obj);
            }
        }
        Ok(results)
    }

    fn create<R: Resource>(&self, obj: &R) -> StateResult<R> {
        let mut obj = obj.clone();
        if obj.namespace().is_empty() {
            return Err(StateError::Invalid(format!("{} without namespace", R::KIND)));
        }
        let meta = obj.meta();
        let segments = [
            meta.namespace.as_str(),
            meta.name.as_str(),
            meta.generate_name.as_deref().unwrap_or_default(),
        ];
        if segments.iter().any(|s| s.contains('/')) {
            return Err(StateError::Invalid(format!(
                "{} {}/{}: namespace and name must not contain '/'",
                R::KIND,
                meta.namespace,
                meta.name
            )));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if obj.name().is_empty() {
            let prefix = obj.meta().generate_name.clone().ok_or_else(|| {
                StateError::Invalid(format!("{} needs a name or generateName", R::KIND))
            })?;
            let name = Self::generate_name(&txn, R::TABLE, obj.namespace(), &prefix)?;
            obj.meta_mut().name = name;
        }

        let key = object_key(obj.namespace(), obj.name());
        {
            let mut table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists { kind: R::KIND, key });
            }

            let meta = obj.meta_mut();
            meta.uid = uuid::Uuid::new_v4().to_string();
            meta.resource_version = 1;
            meta.creation_timestamp = Some(Utc::now());
            meta.deletion_timestamp = None;

            let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, "object created");
        self.publish(&obj, WatchEventType::Added);
        Ok(obj)
    }

    fn update<R: Resource>(&self, obj: &R) -> StateResult<R> {
        let key = object_key(obj.namespace(), obj.name());
        let mut updated = obj.clone();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
            let stored = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound {
                    kind: R::KIND,
                    key: key.clone(),
                })?;
            let stored: Envelope =
                serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;

            if stored.metadata.resource_version != obj.meta().resource_version {
                return Err(StateError::Conflict {
                    kind: R::KIND,
                    key,
                    submitted: obj.meta().resource_version,
                    stored: stored.metadata.resource_version,
                });
            }

            let meta = updated.meta_mut();
            meta.uid = stored.metadata.uid;
            meta.creation_timestamp = stored.metadata.creation_timestamp;
            meta.resource_version = stored.metadata.resource_version + 1;

            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, version = updated.meta().resource_version, "object updated");
        self.publish(&updated, WatchEventType::Modified);
        Ok(updated)
    }

    fn patch<R: Resource>(&self, namespace: &str, name: &str, patch: &Value) -> StateResult<R> {
        let key = object_key(namespace, name);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let patched = {
            let mut table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
            let stored = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound {
                    kind: R::KIND,
                    key: key.clone(),
                })?;
            let original: R = serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;
            let mut doc: Value = serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?;
            merge_patch(&mut doc, patch);

            let mut patched: R = serde_json::from_value(doc)
                .map_err(|e| StateError::Invalid(format!("patch on {} {key}: {e}", R::KIND)))?;

            // Identity and bookkeeping fields are not patchable.
            let before = original.meta();
            let meta = patched.meta_mut();
            meta.name = before.name.clone();
            meta.namespace = before.namespace.clone();
            meta.uid = before.uid.clone();
            meta.creation_timestamp = before.creation_timestamp;
            meta.resource_version = before.resource_version + 1;

            let value = serde_json::to_vec(&patched).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            patched
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, "object patched");
        self.publish(&patched, WatchEventType::Modified);
        Ok(patched)
    }

    fn delete<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<()> {
        let key = object_key(namespace, name);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: R = {
            let mut table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
            let stored = table
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound {
                    kind: R::KIND,
                    key: key.clone(),
                })?;
            serde_json::from_slice(&stored).map_err(map_err!(Deserialize))?
        };
        let cascaded = self.delete_dependents(&txn, removed.uid())?;
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(kind = R::KIND, %key, dependents = cascaded.len(), "object deleted");
        self.publish(&removed, WatchEventType::Deleted);
        for event in cascaded {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn list_all<R: Resource>(&self) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table(R::TABLE)).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let obj: R = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(obj);
        }
        Ok(results)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

fn random_suffix() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    bytes[..NAME_SUFFIX_LEN]
        .iter()
        .map(|b| NAME_ALPHABET[*b as usize % NAME_ALPHABET.len()] as char)
        .collect()
}
