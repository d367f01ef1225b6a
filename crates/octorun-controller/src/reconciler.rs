//! RunnerSet reconciler.
//!
//! One reconciliation loads a runner set, brings its revision history up
//! to date, scales its runners and writes back its status. The status is
//! held in a [`PendingStatus`] for the whole run and flushed exactly once
//! on the way out, whether the run succeeded or not.

use std::collections::HashSet;
use std::sync::Arc;

use octorun_history::{RevisionHistory, RevisionOutcome};
use octorun_state::{
    EventType, IgnoreNotFound, ObjectKey, ObjectStore, Resource, Runner, RunnerPhase, RunnerSet,
    RunnerSetStatus,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::error::{ControllerError, ControllerResult};
use crate::events::{EventRecorder, REASON_REVISION_CREATED};
use crate::fleet::FleetEngine;

/// What a successful reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The runner set no longer exists; nothing to do.
    Gone,
    Reconciled {
        /// Name of the current revision.
        revision: String,
        created: usize,
        deleted: usize,
    },
}

/// A runner set whose status is written back when the scope ends.
pub struct PendingStatus<'a, S> {
    store: &'a S,
    observed: RunnerSetStatus,
    set: RunnerSet,
}

impl<'a, S: ObjectStore> PendingStatus<'a, S> {
    pub fn new(store: &'a S, set: RunnerSet) -> Self {
        Self {
            store,
            observed: set.status.clone(),
            set,
        }
    }

    pub fn set(&self) -> &RunnerSet {
        &self.set
    }

    pub fn set_mut(&mut self) -> &mut RunnerSet {
        &mut self.set
    }

    /// Persist the status if it differs from what was loaded. Returns
    /// whether a write happened.
    pub fn flush(self) -> ControllerResult<bool> {
        if self.set.status == self.observed {
            debug!(runnerset = %self.set.key(), "status unchanged");
            return Ok(false);
        }

        let status = serde_json::to_value(&self.set.status)
            .map_err(|e| octorun_state::StateError::Serialize(e.to_string()))?;
        let patched = self
            .store
            .patch::<RunnerSet>(
                self.set.namespace(),
                self.set.name(),
                &json!({ "status": status }),
            )
            .ignore_not_found()?;
        if patched.is_none() {
            debug!(runnerset = %self.set.key(), "runner set vanished before status flush");
        }
        Ok(patched.is_some())
    }

    /// Run `f` against the runner set and flush the status afterwards,
    /// on success and on failure alike. An error from `f` wins over an
    /// error from the flush.
    pub fn scope<T>(
        store: &'a S,
        set: RunnerSet,
        f: impl FnOnce(&mut RunnerSet) -> ControllerResult<T>,
    ) -> ControllerResult<T> {
        let mut pending = Self::new(store, set);
        let result = f(pending.set_mut());
        let key = pending.set().key();
        match (result, pending.flush()) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(flush_err)) => Err(flush_err),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!(runnerset = %key, error = %flush_err, "status flush failed after reconcile error");
                Err(e)
            }
        }
    }
}

pub struct Reconciler<S> {
    store: S,
    history: RevisionHistory<S>,
    fleet: FleetEngine<S>,
    recorder: Arc<dyn EventRecorder>,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            history: RevisionHistory::new(store.clone()),
            fleet: FleetEngine::new(store.clone(), recorder.clone()),
            store,
            recorder,
        }
    }

    pub fn reconcile(&self, key: &ObjectKey, deadline: Deadline) -> ControllerResult<ReconcileOutcome> {
        let Some(set) = self
            .store
            .get::<RunnerSet>(&key.namespace, &key.name)
            .ignore_not_found()?
        else {
            debug!(runnerset = %key, "runner set not found or already deleted");
            return Ok(ReconcileOutcome::Gone);
        };

        PendingStatus::scope(&self.store, set, |set| self.reconcile_set(set, &deadline))
    }

    fn reconcile_set(&self, set: &mut RunnerSet, deadline: &Deadline) -> ControllerResult<ReconcileOutcome> {
        let key = set.key();
        validate(set)?;
        deadline.check(&key)?;

        let revisions = self
            .history
            .list(set.namespace(), set.uid(), &set.spec.selector)?;
        let current = self.history.reconcile(set, &revisions)?;
        if current.outcome == RevisionOutcome::Created {
            self.recorder.emit(
                &set.object_ref(),
                EventType::Normal,
                REASON_REVISION_CREATED,
                &format!(
                    "Created revision {} ({})",
                    current.revision.name(),
                    current.revision.revision
                ),
            );
        }
        let revision = current.revision.name().to_string();
        set.status.current_revision = Some(revision.clone());
        set.status.selector = set.spec.selector.to_string();
        deadline.check(&key)?;

        let runners = self.fleet.find_runners(set)?;
        if set.metadata.is_deleting() {
            debug!(runnerset = %key, "runner set is being deleted, leaving runners alone");
            return Ok(ReconcileOutcome::Reconciled {
                revision,
                created: 0,
                deleted: 0,
            });
        }
        deadline.check(&key)?;

        let outcome = self.fleet.sync_runners(set, &runners, deadline);
        set.status = post_sync_status(&set.status, &runners, &outcome.created, &outcome.deleted);

        let created = outcome.created.len();
        let deleted = outcome.deleted.len();
        outcome.into_result()?;

        if created > 0 || deleted > 0 {
            info!(runnerset = %key, created, deleted, %revision, "reconciled runner set");
        } else {
            debug!(runnerset = %key, %revision, "runner set in sync");
        }
        Ok(ReconcileOutcome::Reconciled {
            revision,
            created,
            deleted,
        })
    }
}

/// A runner set that can be reconciled at all.
fn validate(set: &RunnerSet) -> ControllerResult<()> {
    let invalid = |reason: String| ControllerError::Invalid {
        key: set.key().to_string(),
        reason,
    };
    let selector = &set.spec.selector;
    if selector.is_empty() {
        return Err(invalid("empty selector".to_string()));
    }
    selector.validate().map_err(|e| invalid(e.to_string()))?;
    if !selector.matches(&set.spec.template.metadata.labels) {
        return Err(invalid(format!(
            "selector {selector} does not match template labels"
        )));
    }
    Ok(())
}

/// Status counts after a sync: survivors keep their phase, new runners
/// start out idle.
fn post_sync_status(
    status: &RunnerSetStatus,
    observed: &[Runner],
    created: &[Runner],
    deleted: &[String],
) -> RunnerSetStatus {
    let deleted: HashSet<&str> = deleted.iter().map(String::as_str).collect();
    let survivors = || observed.iter().filter(|r| !deleted.contains(r.name()));
    let count = |phase: RunnerPhase| survivors().filter(|r| r.status.phase == phase).count();

    RunnerSetStatus {
        runners: (survivors().count() + created.len()) as u32,
        idle_runners: (count(RunnerPhase::Idle) + created.len()) as u32,
        active_runners: count(RunnerPhase::Active) as u32,
        ..status.clone()
    }
}
