//! Administrative commands that work on the state store directly.

use anyhow::Context;
use octorun_history::RevisionHistory;
use octorun_state::{IgnoreNotFound, ObjectKey, ObjectStore, Resource, Runner, RunnerSet};
use serde_json::{Value, json};
use tracing::info;

/// Create the runner set described by `manifest`, or replace the spec,
/// labels and annotations of the stored one. Returns the stored object and
/// whether it was created.
pub fn apply<S: ObjectStore>(store: &S, manifest: &str) -> anyhow::Result<(RunnerSet, bool)> {
    let desired: RunnerSet =
        serde_json::from_str(manifest).context("parsing runner set manifest")?;
    let key = desired.key();

    match store
        .get::<RunnerSet>(&key.namespace, &key.name)
        .ignore_not_found()?
    {
        None => {
            let created = store.create(&desired)?;
            info!(runnerset = %key, "runner set created");
            Ok((created, true))
        }
        Some(mut stored) => {
            stored.metadata.labels = desired.metadata.labels;
            stored.metadata.annotations = desired.metadata.annotations;
            stored.spec = desired.spec;
            let updated = store.update(&stored)?;
            info!(runnerset = %key, "runner set updated");
            Ok((updated, false))
        }
    }
}

/// A runner set together with the runners and revisions it controls.
pub fn get<S: ObjectStore>(store: &S, key: &ObjectKey) -> anyhow::Result<Value> {
    let set: RunnerSet = store.get(&key.namespace, &key.name)?;

    let mut runners: Vec<Runner> = store
        .list::<Runner>(&key.namespace, &set.spec.selector)?
        .into_iter()
        .filter(|r| r.metadata.is_controlled_by(set.uid()))
        .collect();
    runners.sort_by(|a, b| a.name().cmp(b.name()));

    let revisions = RevisionHistory::new(store.clone()).list(
        &key.namespace,
        set.uid(),
        &set.spec.selector,
    )?;

    Ok(json!({
        "runnerSet": set,
        "runners": runners,
        "revisions": revisions,
    }))
}

pub fn rollback<S: ObjectStore>(store: &S, key: &ObjectKey, revision: i64) -> anyhow::Result<RunnerSet> {
    let set: RunnerSet = store.get(&key.namespace, &key.name)?;
    let restored = RevisionHistory::new(store.clone()).rollback(&set, revision)?;
    Ok(restored)
}
