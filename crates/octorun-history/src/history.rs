//! Revision history of a runner set.
//!
//! Revisions are immutable snapshots of a runner set's template, named
//! after the fingerprint of their payload. Reconciling the history either
//! finds the latest revision unchanged, promotes an older revision with
//! an equal payload to the next revision number, or records a new one.

use std::cmp::Ordering;

use octorun_state::{
    ControllerRevision, LabelSelector, ObjectMeta, ObjectStore, Resource, RunnerSet,
    set_controller_reference,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{HistoryError, HistoryResult};
use crate::hash::{fingerprint, revision_name};

/// Reserved label carrying a revision's fingerprint.
pub const REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// Upper bound on fingerprint re-rolls for one reconciliation.
pub const MAX_COLLISION_ATTEMPTS: u32 = 32;

/// What [`RevisionHistory::reconcile`] did to produce the current revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// The latest revision already matched the template.
    Unchanged,
    /// An older revision with an equal payload got the next revision number.
    Promoted,
    /// A new revision object was stored.
    Created,
}

#[derive(Debug, Clone)]
pub struct CurrentRevision {
    pub revision: ControllerRevision,
    pub outcome: RevisionOutcome,
}

/// Total order over revisions: revision number ascending, then newest
/// first, then name. The last element is the latest revision.
pub fn compare_revisions(a: &ControllerRevision, b: &ControllerRevision) -> Ordering {
    a.revision
        .cmp(&b.revision)
        .then_with(|| {
            b.metadata
                .creation_timestamp
                .cmp(&a.metadata.creation_timestamp)
        })
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(compare_revisions);
}

/// Next revision number after the given history.
pub fn next_revision(revisions: &[ControllerRevision]) -> i64 {
    revisions.iter().map(|r| r.revision).max().map_or(1, |max| max + 1)
}

/// Build (without storing) the revision for `set`'s current template.
pub fn new_revision(
    set: &RunnerSet,
    data: Value,
    revision: i64,
) -> HistoryResult<ControllerRevision> {
    let mut rev = ControllerRevision {
        metadata: ObjectMeta {
            namespace: set.metadata.namespace.clone(),
            labels: set.spec.template.metadata.labels.clone(),
            annotations: set.metadata.annotations.clone(),
            ..Default::default()
        },
        data,
        revision,
    };
    set_controller_reference(set, &mut rev)?;

    let hash = fingerprint(&rev.payload(), set.status.collision_count);
    rev.metadata.name = revision_name(set.name(), &hash);
    rev.metadata
        .labels
        .insert(REVISION_HASH_LABEL.to_string(), hash);
    Ok(rev)
}

/// Revision history manager over an object store.
#[derive(Clone)]
pub struct RevisionHistory<S> {
    store: S,
}

impl<S: ObjectStore> RevisionHistory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Revisions in `namespace` matching `selector` and controlled by
    /// `owner_uid`, in [`compare_revisions`] order.
    pub fn list(
        &self,
        namespace: &str,
        owner_uid: &str,
        selector: &LabelSelector,
    ) -> HistoryResult<Vec<ControllerRevision>> {
        let mut revisions: Vec<ControllerRevision> = self
            .store
            .list::<ControllerRevision>(namespace, selector)?
            .into_iter()
            .filter(|r| r.metadata.is_controlled_by(owner_uid))
            .collect();
        sort_revisions(&mut revisions);
        Ok(revisions)
    }

    /// Make sure a revision describing `set`'s template exists and is the
    /// latest one. `revisions` must come from [`Self::list`].
    ///
    /// Bumps `set.status.collision_count` when a fingerprint collides; the
    /// caller persists it with the rest of the status.
    pub fn reconcile(
        &self,
        set: &mut RunnerSet,
        revisions: &[ControllerRevision],
    ) -> HistoryResult<CurrentRevision> {
        let data = codec::revision_data(set)?;
        let next = next_revision(revisions);

        if let Some(latest) = revisions.last()
            && latest.data == data
        {
            debug!(
                runnerset = %set.key(),
                revision = latest.revision,
                name = %latest.name(),
                "template unchanged"
            );
            return Ok(CurrentRevision {
                revision: latest.clone(),
                outcome: RevisionOutcome::Unchanged,
            });
        }

        // Equality is by payload only; revision numbers and metadata differ.
        if let Some(equal) = revisions.iter().rev().find(|r| r.data == data) {
            let promoted = self.promote(equal, next)?;
            info!(
                runnerset = %set.key(),
                name = %promoted.name(),
                revision = promoted.revision,
                "template returned to a previous revision"
            );
            return Ok(CurrentRevision {
                revision: promoted,
                outcome: RevisionOutcome::Promoted,
            });
        }

        self.create_revision(set, data, next, revisions)
    }

    /// Rewrite the revision number of `rev`; the only permitted mutation.
    fn promote(&self, rev: &ControllerRevision, next: i64) -> HistoryResult<ControllerRevision> {
        let mut promoted = rev.clone();
        promoted.revision = next;
        Ok(self.store.update(&promoted)?)
    }

    fn create_revision(
        &self,
        set: &mut RunnerSet,
        data: Value,
        next: i64,
        revisions: &[ControllerRevision],
    ) -> HistoryResult<CurrentRevision> {
        for _ in 0..MAX_COLLISION_ATTEMPTS {
            let candidate = new_revision(set, data.clone(), next)?;

            // Same name as a listed revision means same fingerprint with a
            // different payload, since equal payloads were handled already.
            let listed_clash = revisions.iter().any(|r| r.name() == candidate.name());
            if !listed_clash {
                match self.store.create(&candidate) {
                    Ok(created) => {
                        info!(
                            runnerset = %set.key(),
                            name = %created.name(),
                            revision = created.revision,
                            "created revision"
                        );
                        return Ok(CurrentRevision {
                            revision: created,
                            outcome: RevisionOutcome::Created,
                        });
                    }
                    Err(e) if e.is_already_exists() => {
                        let existing: ControllerRevision = self
                            .store
                            .get(candidate.namespace(), candidate.name())?;
                        if existing.metadata.is_controlled_by(set.uid()) && existing.data == data {
                            // Stored by an earlier, interrupted reconciliation.
                            if existing.revision == next {
                                return Ok(CurrentRevision {
                                    revision: existing,
                                    outcome: RevisionOutcome::Unchanged,
                                });
                            }
                            return Ok(CurrentRevision {
                                revision: self.promote(&existing, next)?,
                                outcome: RevisionOutcome::Promoted,
                            });
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let count = set.status.collision_count.unwrap_or(0).saturating_add(1);
            warn!(
                runnerset = %set.key(),
                name = %candidate.name(),
                collision_count = count,
                "revision name collision"
            );
            set.status.collision_count = Some(count);
        }

        Err(HistoryError::CollisionRetriesExhausted {
            set: set.key().to_string(),
            attempts: MAX_COLLISION_ATTEMPTS,
        })
    }

    /// Restore `set`'s template from the revision with the given number and
    /// store the result. Does not touch runners; the next reconciliation
    /// records the restored template as the latest revision.
    pub fn rollback(&self, set: &RunnerSet, revision: i64) -> HistoryResult<RunnerSet> {
        let revisions = self.list(set.namespace(), set.uid(), &set.spec.selector)?;
        let target = revisions
            .iter()
            .rev()
            .find(|r| r.revision == revision)
            .ok_or_else(|| HistoryError::RevisionNotFound {
                set: set.key().to_string(),
                revision,
            })?;

        let restored = codec::restore_value(set, &target.data)?;
        let updated = self.store.update(&restored)?;
        info!(
            runnerset = %set.key(),
            revision,
            name = %target.name(),
            "rolled back template"
        );
        Ok(updated)
    }
}
