//! Controller loop.
//!
//! Feeds runner set keys into a [`WorkQueue`] from three sources: store
//! watch events, a periodic resync of every runner set, and failed
//! reconciliations coming back after their backoff. A fixed pool of
//! workers drains the queue, running each reconciliation on the blocking
//! pool under its own deadline.

use std::sync::Arc;
use std::time::Duration;

use octorun_core::config::Timings;
use octorun_state::{ObjectKey, ObjectStore, Resource, RunnerSet, WatchEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::deadline::Deadline;
use crate::error::{ControllerError, ControllerResult};
use crate::events::EventRecorder;
use crate::queue::{Backoff, WorkQueue};
use crate::reconciler::{ReconcileOutcome, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_interval: Duration,
    pub reconcile_timeout: Duration,
    pub backoff: Backoff,
}

impl ControllerSettings {
    pub fn new(workers: usize, timings: &Timings) -> Self {
        Self {
            workers: workers.max(1),
            resync_interval: timings.resync_interval,
            reconcile_timeout: timings.reconcile_timeout,
            backoff: Backoff::new(timings.base_delay, timings.max_delay),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            reconcile_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

/// Runner set to reconcile after a change to the given object.
///
/// Runner sets map to themselves; runners and revisions map to the runner
/// set controlling them. Orphans map to nothing and are found by resync.
pub fn runner_set_for(event: &WatchEvent) -> Option<ObjectKey> {
    match event.kind.as_str() {
        "RunnerSet" => Some(event.key.clone()),
        "Runner" | "ControllerRevision" => event
            .controller
            .as_ref()
            .filter(|owner| owner.kind == RunnerSet::KIND)
            .map(|owner| ObjectKey::new(&event.key.namespace, &owner.name)),
        _ => None,
    }
}

pub struct Controller<S> {
    store: S,
    reconciler: Arc<Reconciler<S>>,
    queue: Arc<WorkQueue>,
    settings: ControllerSettings,
}

impl<S: ObjectStore> Controller<S> {
    pub fn new(store: S, recorder: Arc<dyn EventRecorder>, settings: ControllerSettings) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(store.clone(), recorder)),
            queue: Arc::new(WorkQueue::new(settings.backoff)),
            store,
            settings,
        }
    }

    /// Queue every runner set in the store.
    pub fn enqueue_all(&self) -> ControllerResult<usize> {
        let sets: Vec<RunnerSet> = self.store.list_all()?;
        let count = sets.len();
        for set in sets {
            self.queue.add(set.key());
        }
        debug!(count, "queued all runner sets");
        Ok(count)
    }

    fn resync(&self) {
        if let Err(e) = self.enqueue_all() {
            error!(error = %e, "resync failed to list runner sets");
        }
    }

    /// Run until `shutdown` flips, then drain the workers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.settings.workers,
            resync_secs = self.settings.resync_interval.as_secs(),
            "runnerset controller started"
        );

        // Subscribe before the initial listing so no change falls in between.
        let mut events = self.store.watch();

        let mut workers = JoinSet::new();
        for id in 0..self.settings.workers {
            workers.spawn(worker(
                id,
                self.queue.clone(),
                self.reconciler.clone(),
                self.settings.reconcile_timeout,
            ));
        }

        let mut resync = tokio::time::interval(self.settings.resync_interval);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(key) = runner_set_for(&event) {
                            self.queue.add(key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "watch lagged, resyncing");
                        self.resync();
                    }
                    Err(RecvError::Closed) => {
                        warn!("watch closed, stopping controller");
                        break;
                    }
                },
                // The first tick fires immediately and does the initial sync.
                _ = resync.tick() => self.resync(),
                _ = shutdown.changed() => {
                    info!("runnerset controller shutting down");
                    break;
                }
            }
        }

        self.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "controller worker panicked");
            }
        }
        info!("runnerset controller stopped");
    }
}

async fn worker<S: ObjectStore>(
    id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler<S>>,
    timeout: Duration,
) {
    while let Some(key) = queue.get().await {
        let deadline = Deadline::after(timeout);
        let result = {
            let reconciler = reconciler.clone();
            let key = key.clone();
            tokio::task::spawn_blocking(move || reconciler.reconcile(&key, deadline))
                .await
                .unwrap_or_else(|e| Err(ControllerError::Task(e.to_string())))
        };

        match result {
            Ok(outcome) => {
                queue.forget(&key);
                match outcome {
                    ReconcileOutcome::Gone => debug!(worker = id, runnerset = %key, "runner set gone"),
                    ReconcileOutcome::Reconciled { revision, created, deleted } => debug!(
                        worker = id,
                        runnerset = %key,
                        %revision,
                        created,
                        deleted,
                        "reconcile finished"
                    ),
                }
            }
            Err(e) if e.is_transient() => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    worker = id,
                    runnerset = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed, will retry"
                );
            }
            Err(e) => {
                queue.forget(&key);
                error!(worker = id, runnerset = %key, error = %e, "reconcile failed permanently");
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
