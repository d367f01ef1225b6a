//! Fleet diff and scaling.
//!
//! Observes the runners selected by a runner set, adopts orphans, reaps
//! completed runners and issues the creates or deletes needed to reach the
//! desired count. Every invocation recomputes the full diff from what the
//! store holds now.

use std::sync::Arc;

use octorun_state::{
    EventType, IgnoreNotFound, ObjectMeta, ObjectStore, Resource, Runner, RunnerPhase, RunnerSet,
    set_controller_reference,
};
use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::error::{AggregateError, ControllerError, ControllerResult};
use crate::events::{
    EventRecorder, REASON_RUNNER_ADOPTED, REASON_RUNNER_CREATED, REASON_RUNNER_DELETED,
};
use crate::priority::select_for_deletion;

/// Result of [`FleetEngine::sync_runners`]. Partial failures do not undo
/// the operations that succeeded.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub created: Vec<Runner>,
    /// Names of runners that are gone, including ones already missing.
    pub deleted: Vec<String>,
    pub errors: Vec<ControllerError>,
}

impl SyncOutcome {
    pub fn is_in_sync(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.errors.is_empty()
    }

    /// `Err` with every collected failure, if there were any.
    pub fn into_result(self) -> ControllerResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError(self.errors).into())
        }
    }
}

pub struct FleetEngine<S> {
    store: S,
    recorder: Arc<dyn EventRecorder>,
}

impl<S: ObjectStore> FleetEngine<S> {
    pub fn new(store: S, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Runners that belong to `set`.
    ///
    /// Runners controlled by another owner are skipped, orphans are
    /// adopted, and completed runners are deleted and left out. The
    /// observed counts are written into `set.status`.
    pub fn find_runners(&self, set: &mut RunnerSet) -> ControllerResult<Vec<Runner>> {
        let listed: Vec<Runner> = self.store.list(set.namespace(), &set.spec.selector)?;

        let mut idle = 0;
        let mut active = 0;
        let mut runners = Vec::with_capacity(listed.len());
        for runner in listed {
            if let Some(owner) = runner.metadata.controller_of()
                && owner.uid != set.uid()
            {
                continue;
            }

            let runner = match self.adopt_runner(set, runner) {
                Ok(runner) => runner,
                Err(e) => {
                    warn!(runnerset = %set.key(), error = %e, "unable to adopt orphan runner");
                    continue;
                }
            };

            match runner.status.phase {
                RunnerPhase::Idle => idle += 1,
                RunnerPhase::Active => active += 1,
                RunnerPhase::Complete => {
                    debug!(runnerset = %set.key(), runner = %runner.name(), "deleting completed runner");
                    if let Err(e) = self
                        .store
                        .delete::<Runner>(runner.namespace(), runner.name())
                        .ignore_not_found()
                    {
                        warn!(
                            runnerset = %set.key(),
                            runner = %runner.name(),
                            error = %e,
                            "unable to delete completed runner"
                        );
                    }
                    continue;
                }
                RunnerPhase::Other(_) => {}
            }

            runners.push(runner);
        }

        set.status.runners = runners.len() as u32;
        set.status.idle_runners = idle;
        set.status.active_runners = active;
        Ok(runners)
    }

    /// Make `set` the controller of an orphan runner.
    ///
    /// A runner that already has any controller is returned as is, so
    /// ownership is never taken from someone else. The write is
    /// version-checked, so losing a race against another adopter fails
    /// instead of overwriting its claim.
    pub fn adopt_runner(&self, set: &RunnerSet, runner: Runner) -> ControllerResult<Runner> {
        if runner.metadata.controller_of().is_some() {
            return Ok(runner);
        }

        let mut adopted = runner;
        set_controller_reference(set, &mut adopted)?;
        let adopted = self.store.update(&adopted)?;

        info!(runnerset = %set.key(), runner = %adopted.name(), "adopted orphan runner");
        self.recorder.emit(
            &set.object_ref(),
            EventType::Normal,
            REASON_RUNNER_ADOPTED,
            &format!("Successful adopt orphan Runner {}", adopted.name()),
        );
        Ok(adopted)
    }

    /// Create or delete runners until `runners` matches the desired count.
    pub fn sync_runners(
        &self,
        set: &RunnerSet,
        runners: &[Runner],
        deadline: &Deadline,
    ) -> SyncOutcome {
        let desired = set.spec.runners as usize;
        let current = runners.len();
        let mut outcome = SyncOutcome::default();

        if current < desired {
            let diff = desired - current;
            info!(runnerset = %set.key(), runners = current, desired, to_create = diff, "too few runners");
            for _ in 0..diff {
                if let Err(e) = deadline.check(&set.key()) {
                    outcome.errors.push(e);
                    break;
                }
                match self.create_runner(set) {
                    Ok(runner) => outcome.created.push(runner),
                    Err(e) => {
                        warn!(runnerset = %set.key(), error = %e, "unable to create runner");
                        outcome.errors.push(e);
                    }
                }
            }
        } else if current > desired {
            let diff = current - desired;
            info!(runnerset = %set.key(), runners = current, desired, to_delete = diff, "too many runners");
            for runner in select_for_deletion(runners, diff) {
                if let Err(e) = deadline.check(&set.key()) {
                    outcome.errors.push(e);
                    break;
                }
                match self.delete_runner(set, runner) {
                    Ok(()) => outcome.deleted.push(runner.name().to_string()),
                    Err(e) => {
                        warn!(
                            runnerset = %set.key(),
                            runner = %runner.name(),
                            error = %e,
                            "unable to delete runner"
                        );
                        outcome.errors.push(e);
                    }
                }
            }
        } else {
            debug!(runnerset = %set.key(), runners = current, desired, "runners in sync");
        }

        outcome
    }

    fn create_runner(&self, set: &RunnerSet) -> ControllerResult<Runner> {
        let template = &set.spec.template;
        let mut runner = Runner {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", set.name())),
                namespace: set.namespace().to_string(),
                labels: template.metadata.labels.clone(),
                annotations: template.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: template.spec.clone(),
            status: Default::default(),
        };
        set_controller_reference(set, &mut runner)?;
        let created = self.store.create(&runner)?;

        info!(runnerset = %set.key(), runner = %created.name(), "created runner");
        self.recorder.emit(
            &set.object_ref(),
            EventType::Normal,
            REASON_RUNNER_CREATED,
            &format!("Successful create Runner {}", created.name()),
        );
        Ok(created)
    }

    fn delete_runner(&self, set: &RunnerSet, runner: &Runner) -> ControllerResult<()> {
        let existed = self
            .store
            .delete::<Runner>(runner.namespace(), runner.name())
            .ignore_not_found()?
            .is_some();
        if !existed {
            debug!(runnerset = %set.key(), runner = %runner.name(), "runner already gone");
        }

        info!(runnerset = %set.key(), runner = %runner.name(), "deleted runner");
        self.recorder.emit(
            &set.object_ref(),
            EventType::Normal,
            REASON_RUNNER_DELETED,
            &format!("Successful delete Runner {}", runner.name()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventRecorder;
    use octorun_state::{LabelSelector, RunnerSetSpec, RunnerTemplate, StateStore, TemplateMeta};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn setup(desired: u32) -> (StateStore, FleetEngine<StateStore>, RunnerSet) {
        let store = StateStore::open_in_memory().unwrap();
        let labels: BTreeMap<String, String> =
            [("app".to_string(), "builders".to_string())].into_iter().collect();
        let set = store
            .create(&RunnerSet {
                metadata: ObjectMeta::named("ci", "builders"),
                spec: RunnerSetSpec {
                    runners: desired,
                    selector: LabelSelector::from_labels(labels.clone()),
                    template: RunnerTemplate {
                        metadata: TemplateMeta {
                            labels,
                            annotations: [("team".to_string(), "infra".to_string())]
                                .into_iter()
                                .collect(),
                        },
                        spec: json!({"image": "runner:1"}),
                    },
                },
                ..Default::default()
            })
            .unwrap();
        let engine = FleetEngine::new(store.clone(), Arc::new(NoopEventRecorder));
        (store, engine, set)
    }

    fn put_runner(
        store: &StateStore,
        name: &str,
        phase: RunnerPhase,
        owner: Option<&RunnerSet>,
    ) -> Runner {
        let mut runner = Runner {
            metadata: ObjectMeta::named("ci", name),
            ..Default::default()
        };
        runner
            .metadata
            .labels
            .insert("app".to_string(), "builders".to_string());
        runner.status.phase = phase;
        if let Some(owner) = owner {
            set_controller_reference(owner, &mut runner).unwrap();
        }
        store.create(&runner).unwrap()
    }

    #[test]
    fn find_counts_by_phase_and_reaps_completed() {
        let (store, engine, mut set) = setup(3);
        put_runner(&store, "idle", RunnerPhase::Idle, Some(&set));
        put_runner(&store, "busy", RunnerPhase::Active, Some(&set));
        put_runner(&store, "done", RunnerPhase::Complete, Some(&set));
        put_runner(&store, "odd", RunnerPhase::Other("Failed".into()), Some(&set));

        let runners = engine.find_runners(&mut set).unwrap();
        assert_eq!(runners.len(), 3);
        assert_eq!(set.status.runners, 3);
        assert_eq!(set.status.idle_runners, 1);
        assert_eq!(set.status.active_runners, 1);
        assert!(store.get::<Runner>("ci", "done").unwrap_err().is_not_found());
    }

    #[test]
    fn find_adopts_orphans_but_not_foreign_runners() {
        let (store, engine, mut set) = setup(3);
        let mut other = set.clone();
        other.metadata.uid = "someone-else".to_string();
        other.metadata.name = "others".to_string();

        put_runner(&store, "orphan", RunnerPhase::Idle, None);
        put_runner(&store, "foreign", RunnerPhase::Idle, Some(&other));

        let runners = engine.find_runners(&mut set).unwrap();
        let names: Vec<&str> = runners.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["orphan"]);

        let orphan: Runner = store.get("ci", "orphan").unwrap();
        assert!(orphan.metadata.is_controlled_by(set.uid()));
        let foreign: Runner = store.get("ci", "foreign").unwrap();
        assert!(foreign.metadata.is_controlled_by("someone-else"));
    }

    #[test]
    fn adopt_is_a_no_op_for_owned_runners() {
        let (store, engine, set) = setup(1);
        let owned = put_runner(&store, "owned", RunnerPhase::Idle, Some(&set));
        let same = engine.adopt_runner(&set, owned.clone()).unwrap();
        assert_eq!(same.metadata.resource_version, owned.metadata.resource_version);
    }

    #[test]
    fn sync_creates_from_template() {
        let (store, engine, set) = setup(2);
        let outcome = engine.sync_runners(&set, &[], &Deadline::none());
        assert_eq!(outcome.created.len(), 2);
        assert!(outcome.errors.is_empty());

        for runner in &outcome.created {
            assert!(runner.name().starts_with("builders-"));
            assert!(runner.metadata.is_controlled_by(set.uid()));
            assert_eq!(runner.metadata.labels, set.spec.template.metadata.labels);
            assert_eq!(runner.metadata.annotations["team"], "infra");
            assert_eq!(runner.spec, json!({"image": "runner:1"}));
        }
        assert_eq!(store.list_all::<Runner>().unwrap().len(), 2);
    }

    #[test]
    fn sync_deletes_idle_before_active() {
        let (store, engine, mut set) = setup(1);
        put_runner(&store, "a-busy", RunnerPhase::Active, Some(&set));
        put_runner(&store, "b-idle", RunnerPhase::Idle, Some(&set));
        put_runner(&store, "c-idle", RunnerPhase::Idle, Some(&set));

        let runners = engine.find_runners(&mut set).unwrap();
        let outcome = engine.sync_runners(&set, &runners, &Deadline::none());
        assert_eq!(outcome.deleted, vec!["b-idle", "c-idle"]);

        let left: Vec<Runner> = store.list_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name(), "a-busy");
    }

    #[test]
    fn sync_treats_missing_runner_as_deleted() {
        let (store, engine, mut set) = setup(0);
        put_runner(&store, "idle", RunnerPhase::Idle, Some(&set));
        let runners = engine.find_runners(&mut set).unwrap();
        store.delete::<Runner>("ci", "idle").unwrap();

        let outcome = engine.sync_runners(&set, &runners, &Deadline::none());
        assert_eq!(outcome.deleted, vec!["idle"]);
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn sync_in_sync_is_a_no_op() {
        let (store, engine, mut set) = setup(1);
        put_runner(&store, "idle", RunnerPhase::Idle, Some(&set));
        let runners = engine.find_runners(&mut set).unwrap();
        let outcome = engine.sync_runners(&set, &runners, &Deadline::none());
        assert!(outcome.is_in_sync());
    }

    #[test]
    fn sync_stops_at_the_deadline() {
        let (store, engine, set) = setup(3);
        let expired = Deadline::after(std::time::Duration::ZERO);
        let outcome = engine.sync_runners(&set, &[], &expired);
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(store.list_all::<Runner>().unwrap().is_empty());
        assert!(outcome.into_result().unwrap_err().is_transient());
    }
}
