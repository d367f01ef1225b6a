//! End-to-end reconciliation scenarios against the real state store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use octorun_controller::events::{
    REASON_REVISION_CREATED, REASON_RUNNER_ADOPTED, REASON_RUNNER_CREATED, REASON_RUNNER_DELETED,
};
use octorun_controller::{
    ControllerError, Deadline, ReconcileOutcome, Reconciler, StoreEventRecorder,
};
use octorun_history::{REVISION_HASH_LABEL, RevisionHistory};
use octorun_state::{
    ControllerRevision, Event, LabelSelector, ObjectKey, ObjectMeta, ObjectStore, Resource,
    Runner, RunnerPhase, RunnerSet, RunnerSetSpec, RunnerTemplate, StateError, StateResult,
    StateStore, TemplateMeta, WatchEvent, set_controller_reference,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;

// ── Harness ────────────────────────────────────────────────────────

/// Store wrapper that fails selected runner writes.
#[derive(Clone)]
struct FlakyStore {
    inner: StateStore,
    fail_runner_creates: Arc<AtomicBool>,
    fail_deletes: Arc<Mutex<HashSet<String>>>,
}

impl FlakyStore {
    fn new(inner: StateStore) -> Self {
        Self {
            inner,
            fail_runner_creates: Arc::new(AtomicBool::new(false)),
            fail_deletes: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl ObjectStore for FlakyStore {
    fn get<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<R> {
        self.inner.get(namespace, name)
    }

    fn list<R: Resource>(&self, namespace: &str, selector: &LabelSelector) -> StateResult<Vec<R>> {
        self.inner.list(namespace, selector)
    }

    fn create<R: Resource>(&self, obj: &R) -> StateResult<R> {
        if R::KIND == Runner::KIND && self.fail_runner_creates.load(Ordering::SeqCst) {
            return Err(StateError::Write("injected create failure".to_string()));
        }
        self.inner.create(obj)
    }

    fn update<R: Resource>(&self, obj: &R) -> StateResult<R> {
        self.inner.update(obj)
    }

    fn patch<R: Resource>(&self, namespace: &str, name: &str, patch: &Value) -> StateResult<R> {
        self.inner.patch(namespace, name, patch)
    }

    fn delete<R: Resource>(&self, namespace: &str, name: &str) -> StateResult<()> {
        if self.fail_deletes.lock().unwrap().contains(name) {
            return Err(StateError::Write(format!("injected delete failure for {name}")));
        }
        self.inner.delete::<R>(namespace, name)
    }

    fn list_all<R: Resource>(&self) -> StateResult<Vec<R>> {
        self.inner.list_all()
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }
}

struct Harness {
    store: FlakyStore,
    reconciler: Reconciler<FlakyStore>,
}

impl Harness {
    fn new() -> Self {
        let store = FlakyStore::new(StateStore::open_in_memory().unwrap());
        let recorder = Arc::new(StoreEventRecorder::new(store.clone(), "runnerset-controller"));
        let reconciler = Reconciler::new(store.clone(), recorder);
        Self { store, reconciler }
    }

    fn labels() -> BTreeMap<String, String> {
        [("app".to_string(), "builders".to_string())].into_iter().collect()
    }

    fn create_set(&self, desired: u32, image: &str) -> RunnerSet {
        self.store
            .create(&RunnerSet {
                metadata: ObjectMeta::named("ci", "builders"),
                spec: RunnerSetSpec {
                    runners: desired,
                    selector: LabelSelector::from_labels(Self::labels()),
                    template: RunnerTemplate {
                        metadata: TemplateMeta {
                            labels: Self::labels(),
                            annotations: [("team".to_string(), "infra".to_string())]
                                .into_iter()
                                .collect(),
                        },
                        spec: json!({"image": image, "resources": {"cpu": "2"}}),
                    },
                },
                ..Default::default()
            })
            .unwrap()
    }

    fn put_runner(&self, name: &str, phase: RunnerPhase, owner: Option<&RunnerSet>) -> Runner {
        let mut runner = Runner {
            metadata: ObjectMeta::named("ci", name),
            ..Default::default()
        };
        runner.metadata.labels = Self::labels();
        runner.status.phase = phase;
        if let Some(owner) = owner {
            set_controller_reference(owner, &mut runner).unwrap();
        }
        self.store.create(&runner).unwrap()
    }

    fn set_image(&self, image: &str) {
        let mut set = self.get_set();
        set.spec.template.spec["image"] = json!(image);
        self.store.update(&set).unwrap();
    }

    fn reconcile(&self) -> Result<ReconcileOutcome, ControllerError> {
        self.reconciler
            .reconcile(&ObjectKey::new("ci", "builders"), Deadline::none())
    }

    fn get_set(&self) -> RunnerSet {
        self.store.get("ci", "builders").unwrap()
    }

    fn runners(&self) -> Vec<Runner> {
        self.store.list_all().unwrap()
    }

    fn revisions(&self) -> Vec<ControllerRevision> {
        self.store.list_all().unwrap()
    }

    fn events_with_reason(&self, reason: &str) -> Vec<Event> {
        self.store
            .list_all::<Event>()
            .unwrap()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

fn runner_names(runners: &[Runner]) -> Vec<String> {
    let mut names: Vec<String> = runners.iter().map(|r| r.metadata.name.clone()).collect();
    names.sort();
    names
}

// ── Scaling ────────────────────────────────────────────────────────

#[test]
fn three_desired_one_active_creates_two_idle() {
    let h = Harness::new();
    let set = h.create_set(3, "runner:1");
    h.put_runner("busy", RunnerPhase::Active, Some(&set));

    let outcome = h.reconcile().unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Reconciled { created: 2, deleted: 0, .. }
    ));

    let runners = h.runners();
    assert_eq!(runners.len(), 3);
    for runner in runners.iter().filter(|r| r.name() != "busy") {
        assert!(runner.metadata.is_controlled_by(set.uid()));
        assert_eq!(runner.metadata.labels, set.spec.template.metadata.labels);
        assert_eq!(runner.metadata.annotations, set.spec.template.metadata.annotations);
        assert_eq!(runner.spec, set.spec.template.spec);
        assert_eq!(runner.status.phase, RunnerPhase::Idle);
    }

    let status = h.get_set().status;
    assert_eq!(status.runners, 3);
    assert_eq!(status.active_runners, 1);
    assert_eq!(status.idle_runners, 2);
    assert_eq!(h.events_with_reason(REASON_RUNNER_CREATED).len(), 2);
}

#[test]
fn two_desired_four_present_deletes_the_idle_ones() {
    let h = Harness::new();
    let set = h.create_set(2, "runner:1");
    h.put_runner("active-1", RunnerPhase::Active, Some(&set));
    h.put_runner("idle-1", RunnerPhase::Idle, Some(&set));
    h.put_runner("active-2", RunnerPhase::Active, Some(&set));
    h.put_runner("idle-2", RunnerPhase::Idle, Some(&set));

    let outcome = h.reconcile().unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Reconciled { created: 0, deleted: 2, .. }
    ));
    assert_eq!(runner_names(&h.runners()), vec!["active-1", "active-2"]);

    let status = h.get_set().status;
    assert_eq!(status.runners, 2);
    assert_eq!(status.active_runners, 2);
    assert_eq!(status.idle_runners, 0);
    assert_eq!(h.events_with_reason(REASON_RUNNER_DELETED).len(), 2);
}

#[test]
fn active_runners_go_only_when_nothing_else_is_left() {
    let h = Harness::new();
    let set = h.create_set(1, "runner:1");
    h.put_runner("active-1", RunnerPhase::Active, Some(&set));
    h.put_runner("active-2", RunnerPhase::Active, Some(&set));
    h.put_runner("idle", RunnerPhase::Idle, Some(&set));

    h.reconcile().unwrap();
    let left = h.runners();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].status.phase, RunnerPhase::Active);
}

#[test]
fn completed_runners_are_reaped_and_replaced() {
    let h = Harness::new();
    let set = h.create_set(2, "runner:1");
    h.put_runner("done", RunnerPhase::Complete, Some(&set));
    h.put_runner("idle", RunnerPhase::Idle, Some(&set));

    h.reconcile().unwrap();
    let names = runner_names(&h.runners());
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"done".to_string()));
    assert!(names.contains(&"idle".to_string()));
}

// ── Idempotence ────────────────────────────────────────────────────

#[test]
fn second_reconcile_is_a_pure_no_op() {
    let h = Harness::new();
    h.create_set(3, "runner:1");

    let first = h.reconcile().unwrap();
    let set_after_first = h.get_set();
    let runners_after_first = runner_names(&h.runners());
    let events_after_first = h.store.list_all::<Event>().unwrap().len();

    let second = h.reconcile().unwrap();
    let ReconcileOutcome::Reconciled { revision: first_rev, .. } = first else {
        panic!("first reconcile found nothing");
    };
    assert_eq!(
        second,
        ReconcileOutcome::Reconciled {
            revision: first_rev,
            created: 0,
            deleted: 0
        }
    );

    assert_eq!(
        h.get_set().metadata.resource_version,
        set_after_first.metadata.resource_version
    );
    assert_eq!(runner_names(&h.runners()), runners_after_first);
    assert_eq!(h.revisions().len(), 1);
    assert_eq!(h.store.list_all::<Event>().unwrap().len(), events_after_first);
}

// ── Revisions ──────────────────────────────────────────────────────

#[test]
fn unchanged_template_keeps_fingerprint_and_number() {
    let h = Harness::new();
    h.create_set(1, "runner:1");

    h.reconcile().unwrap();
    let first = h.revisions().remove(0);
    h.reconcile().unwrap();
    let revisions = h.revisions();

    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].name(), first.name());
    assert_eq!(revisions[0].revision, first.revision);
    assert_eq!(
        revisions[0].metadata.labels[REVISION_HASH_LABEL],
        first.metadata.labels[REVISION_HASH_LABEL]
    );
    assert_eq!(revisions[0].metadata.resource_version, first.metadata.resource_version);
    assert_eq!(h.events_with_reason(REASON_REVISION_CREATED).len(), 1);
}

#[test]
fn returning_template_reuses_its_revision() {
    let h = Harness::new();
    h.create_set(1, "runner:1");

    h.reconcile().unwrap();
    let v1 = h.get_set().status.current_revision.unwrap();
    h.set_image("runner:2");
    h.reconcile().unwrap();
    let v2 = h.get_set().status.current_revision.unwrap();
    h.set_image("runner:1");
    h.reconcile().unwrap();
    let v3 = h.get_set().status.current_revision.unwrap();

    assert_ne!(v1, v2);
    assert_eq!(v3, v1);
    assert_eq!(h.revisions().len(), 2);

    let current: ControllerRevision = h.store.get("ci", &v3).unwrap();
    assert_eq!(current.revision, 3);
    let other: ControllerRevision = h.store.get("ci", &v2).unwrap();
    assert_eq!(other.revision, 2);
}

#[test]
fn current_revision_numbers_never_decrease() {
    let h = Harness::new();
    h.create_set(1, "runner:1");

    let mut seen = Vec::new();
    for image in ["runner:1", "runner:2", "runner:3", "runner:2", "runner:1", "runner:1"] {
        h.set_image(image);
        h.reconcile().unwrap();
        let name = h.get_set().status.current_revision.unwrap();
        let rev: ControllerRevision = h.store.get("ci", &name).unwrap();
        seen.push(rev.revision);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(h.revisions().len(), 3);
}

#[test]
fn rollback_then_reconcile_promotes_the_old_revision() {
    let h = Harness::new();
    h.create_set(1, "runner:1");
    h.reconcile().unwrap();
    let v1 = h.get_set().status.current_revision.unwrap();
    h.set_image("runner:2");
    h.reconcile().unwrap();

    let history = RevisionHistory::new(h.store.clone());
    let rolled = history.rollback(&h.get_set(), 1).unwrap();
    assert_eq!(rolled.spec.template.spec["image"], "runner:1");

    h.reconcile().unwrap();
    assert_eq!(h.get_set().status.current_revision.unwrap(), v1);
    assert_eq!(h.revisions().len(), 2);
}

// ── Ownership ──────────────────────────────────────────────────────

#[test]
fn orphans_are_adopted_foreign_runners_are_not() {
    let h = Harness::new();
    let set = h.create_set(2, "runner:1");
    let mut stranger = set.clone();
    stranger.metadata.name = "strangers".to_string();
    stranger.metadata.uid = "stranger-uid".to_string();

    h.put_runner("orphan", RunnerPhase::Idle, None);
    h.put_runner("foreign", RunnerPhase::Idle, Some(&stranger));

    h.reconcile().unwrap();

    let orphan: Runner = h.store.get("ci", "orphan").unwrap();
    assert!(orphan.metadata.is_controlled_by(set.uid()));
    let foreign: Runner = h.store.get("ci", "foreign").unwrap();
    assert!(foreign.metadata.is_controlled_by("stranger-uid"));
    assert_eq!(foreign.metadata.owner_references.len(), 1);

    // orphan + one new runner; the foreign one is not counted
    let owned = h
        .runners()
        .into_iter()
        .filter(|r| r.metadata.is_controlled_by(set.uid()))
        .count();
    assert_eq!(owned, 2);
    assert_eq!(h.get_set().status.runners, 2);
    assert_eq!(h.events_with_reason(REASON_RUNNER_ADOPTED).len(), 1);
}

// ── Failures ───────────────────────────────────────────────────────

#[test]
fn failed_creates_are_aggregated_and_status_still_flushed() {
    let h = Harness::new();
    h.create_set(3, "runner:1");
    h.store.fail_runner_creates.store(true, Ordering::SeqCst);

    let err = h.reconcile().unwrap_err();
    let ControllerError::Aggregate(agg) = &err else {
        panic!("expected an aggregate error, got {err}");
    };
    assert_eq!(agg.len(), 3);
    assert!(err.is_transient());
    assert!(h.events_with_reason(REASON_RUNNER_CREATED).is_empty());

    // Revision and selector were recorded despite the failure.
    let status = h.get_set().status;
    assert!(status.current_revision.is_some());
    assert_eq!(status.selector, "app=builders");
    assert_eq!(status.runners, 0);

    h.store.fail_runner_creates.store(false, Ordering::SeqCst);
    h.reconcile().unwrap();
    assert_eq!(h.runners().len(), 3);
}

#[test]
fn failed_delete_does_not_stop_the_others() {
    let h = Harness::new();
    let set = h.create_set(0, "runner:1");
    h.put_runner("stuck", RunnerPhase::Idle, Some(&set));
    h.put_runner("free-1", RunnerPhase::Idle, Some(&set));
    h.put_runner("free-2", RunnerPhase::Idle, Some(&set));
    h.store.fail_deletes.lock().unwrap().insert("stuck".to_string());

    let err = h.reconcile().unwrap_err();
    let ControllerError::Aggregate(agg) = &err else {
        panic!("expected an aggregate error, got {err}");
    };
    assert_eq!(agg.len(), 1);
    assert!(err.to_string().contains("stuck"));
    assert_eq!(runner_names(&h.runners()), vec!["stuck"]);
    assert_eq!(h.get_set().status.runners, 1);
}

#[test]
fn deleted_runner_set_is_not_an_error() {
    let h = Harness::new();
    h.create_set(2, "runner:1");
    h.reconcile().unwrap();

    h.store.delete::<RunnerSet>("ci", "builders").unwrap();
    assert!(h.runners().is_empty(), "runners are removed with their set");
    assert!(h.revisions().is_empty(), "revisions are removed with their set");
    assert_eq!(h.reconcile().unwrap(), ReconcileOutcome::Gone);
}
