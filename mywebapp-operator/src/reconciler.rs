use crate::{
    cluster_api::ClusterApi,
    configuration::SpecDefaults,
    deployment::{is_owned_by, ChildDescriptor},
    errors::ControllerError,
    tracker::OwnershipTracker,
    utils::NamespacedName,
};
use json_patch::diff;
use mywebapp_operator_apis::{Condition, MyWebApp, MyWebAppStatus};
use std::sync::Arc;

pub(crate) const READY: &'static str = "Ready";
pub(crate) const SUCCESS: &'static str = "Success";
pub(crate) const INVALID_SPEC: &'static str = "InvalidSpec";
pub(crate) const CHILD_CONFLICT: &'static str = "ChildConflict";
pub(crate) const RECONCILE_FAILED: &'static str = "ReconcileFailed";

/// Lifecycle of one `MyWebApp` as seen by the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReconcileState {
    Unknown,
    EnsuringChild,
    Steady,
    FailedTransient,
    /// A permanent failure, left only by a new spec revision or a deletion.
    Failed,
    Deleting,
    Absent,
}

impl std::fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconcileState::Unknown => "UNKNOWN",
            ReconcileState::EnsuringChild => "ENSURING_CHILD",
            ReconcileState::Steady => "STEADY",
            ReconcileState::FailedTransient => "FAILED_TRANSIENT",
            ReconcileState::Failed => "FAILED",
            ReconcileState::Deleting => "DELETING",
            ReconcileState::Absent => "ABSENT",
        };
        f.write_str(s)
    }
}

/// What a reconcile did to the Deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChildAction {
    Created,
    Patched,
    Unchanged,
    Deleted,
    AlreadyAbsent,
}

impl ChildAction {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ChildAction::Created | ChildAction::Patched | ChildAction::Deleted
        )
    }
}

impl std::fmt::Display for ChildAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChildAction::Created => "created",
            ChildAction::Patched => "patched",
            ChildAction::Unchanged => "unchanged",
            ChildAction::Deleted => "deleted",
            ChildAction::AlreadyAbsent => "already_absent",
        };
        f.write_str(s)
    }
}

/// Outcome of a single reconcile, consumed by the observer after the fact.
#[derive(Debug)]
pub(crate) struct ReconcileReport {
    pub key: NamespacedName,
    /// Spec revision the reconcile acted on, empty for deletions.
    pub revision: String,
    pub initial: ReconcileState,
    pub transitions: Vec<(ReconcileState, ReconcileState)>,
    pub actions: Vec<ChildAction>,
    /// Non-fatal problems, e.g. a failed status write.
    pub warnings: Vec<String>,
    pub outcome: Result<(), ControllerError>,
}

impl ReconcileReport {
    fn new(key: &NamespacedName, revision: String) -> Self {
        Self {
            key: key.clone(),
            revision,
            initial: ReconcileState::Unknown,
            transitions: vec![],
            actions: vec![],
            warnings: vec![],
            outcome: Ok(()),
        }
    }

    pub fn state(&self) -> ReconcileState {
        self.transitions
            .last()
            .map_or(self.initial, |(_, to)| *to)
    }

    fn enter(&mut self, state: ReconcileState) {
        let from = self.state();
        if from != state {
            self.transitions.push((from, state));
        }
    }

    pub fn into_result(self) -> Result<(), ControllerError> {
        self.outcome
    }
}

/// Converges the Deployment of one `MyWebApp` towards its declared spec.
pub(crate) struct Reconciler {
    api: Arc<dyn ClusterApi>,
    tracker: Arc<dyn OwnershipTracker>,
    defaults: SpecDefaults,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        tracker: Arc<dyn OwnershipTracker>,
        defaults: SpecDefaults,
    ) -> Self {
        Self {
            api,
            tracker,
            defaults,
        }
    }

    /// Ensure the Deployment for `key` matches `desired`, or remove it when
    /// `desired` is `None`.
    pub async fn reconcile(
        &self,
        key: &NamespacedName,
        desired: Option<&MyWebApp>,
    ) -> ReconcileReport {
        let revision = desired.map(|d| d.spec_revision()).unwrap_or_default();
        let mut report = ReconcileReport::new(key, revision);
        let result = match Self::check_identity(key, desired) {
            Err(e) => Err(e),
            Ok(()) => match desired {
                Some(parent) => self.ensure(key, parent, &mut report).await,
                None => self.cleanup(key, &mut report).await,
            },
        };
        if let Err(e) = &result {
            report.enter(if e.is_temporary() {
                ReconcileState::FailedTransient
            } else {
                ReconcileState::Failed
            });
        }
        report.outcome = result;
        report
    }

    fn check_identity(
        key: &NamespacedName,
        desired: Option<&MyWebApp>,
    ) -> Result<(), ControllerError> {
        if !key.is_valid() {
            return Err(ControllerError::Contract(format!(
                "reconcile invoked without namespace or name: {:?}",
                key
            )));
        }
        if let Some(parent) = desired {
            let actual = NamespacedName::from(parent);
            if actual != *key {
                return Err(ControllerError::Contract(format!(
                    "reconcile of {} invoked with a snapshot of {}",
                    key,
                    parent.versioned_id()
                )));
            }
        }
        Ok(())
    }

    /// Converge, recording permanent failures as `Ready=False` on the parent.
    async fn ensure(
        &self,
        key: &NamespacedName,
        parent: &MyWebApp,
        report: &mut ReconcileReport,
    ) -> Result<(), ControllerError> {
        match self.converge(key, parent, report).await {
            Err(e) if !e.is_temporary() => {
                let reason = match e {
                    ControllerError::InvalidSpec(_) => INVALID_SPEC,
                    ControllerError::ChildConflict(_) => CHILD_CONFLICT,
                    _ => RECONCILE_FAILED,
                };
                let condition = Condition::new(READY, Some(false), reason, e.to_string())
                    .with_observed_generation(parent.metadata.generation);
                self.write_status_best_effort(key, condition, None, report)
                    .await;
                Err(e)
            }
            result => result,
        }
    }

    async fn converge(
        &self,
        key: &NamespacedName,
        parent: &MyWebApp,
        report: &mut ReconcileReport,
    ) -> Result<(), ControllerError> {
        let revision = parent.spec_revision();
        let record = self.tracker.lookup(key).await?;
        report.initial = if record.is_some() {
            ReconcileState::Steady
        } else {
            ReconcileState::Unknown
        };
        if record.as_ref().map(|r| r.last_observed_revision.as_str()) != Some(revision.as_str()) {
            report.enter(ReconcileState::EnsuringChild);
        }

        let child = ChildDescriptor::derive(parent, &self.defaults)?;

        // The child is always read so drift is seen even when the revision is unchanged.
        let action = match self.api.get_child(key).await {
            Ok(actual) if !is_owned_by(&actual, key) => {
                return Err(ControllerError::ChildConflict(format!(
                    "Deployment {} exists and is not managed by the operator",
                    key
                )));
            }
            Ok(actual) if child.is_satisfied_by(&actual) => ChildAction::Unchanged,
            Ok(_) => {
                report.enter(ReconcileState::EnsuringChild);
                self.api.patch_child(key, &child.to_deployment()).await?;
                ChildAction::Patched
            }
            Err(e) if e.is_not_found() => {
                report.enter(ReconcileState::EnsuringChild);
                self.api.create_child(&child.to_deployment()).await?;
                ChildAction::Created
            }
            Err(e) => Err(e)?,
        };
        report.actions.push(action);

        match self.tracker.record_created(key, &revision).await {
            Ok(()) => (),
            Err(e) if e.is_not_found() => {
                // The parent disappeared while its child was being written.
                report.enter(ReconcileState::Deleting);
                let action = self.delete_child(key).await?;
                report.actions.push(action);
                report.enter(ReconcileState::Absent);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        report.enter(ReconcileState::Steady);

        let condition = Condition::new(
            READY,
            Some(true),
            SUCCESS,
            format!(
                "Deployment {} runs {} replica(s) of {}",
                child.key, child.replicas, child.image
            ),
        )
        .with_observed_generation(parent.metadata.generation);
        self.write_status_best_effort(key, condition, Some(revision), report)
            .await;
        Ok(())
    }

    async fn cleanup(
        &self,
        key: &NamespacedName,
        report: &mut ReconcileReport,
    ) -> Result<(), ControllerError> {
        let record = self.tracker.lookup(key).await?;
        report.initial = if record.is_some() {
            ReconcileState::Steady
        } else {
            ReconcileState::Unknown
        };
        report.enter(ReconcileState::Deleting);
        let action = if record.map_or(false, |r| r.child_created) {
            self.delete_child(key).await?
        } else {
            // Without a record the child may still exist if the record write was lost.
            match self.api.get_child(key).await {
                Ok(child) if is_owned_by(&child, key) => self.delete_child(key).await?,
                Ok(_) => {
                    report
                        .warnings
                        .push(format!("Deployment {} is not managed by the operator, left in place", key));
                    ChildAction::Unchanged
                }
                Err(e) if e.is_not_found() => ChildAction::AlreadyAbsent,
                Err(e) => Err(e)?,
            }
        };
        report.actions.push(action);
        self.tracker.record_deleted(key).await?;
        report.enter(ReconcileState::Absent);
        Ok(())
    }

    async fn delete_child(&self, key: &NamespacedName) -> Result<ChildAction, ControllerError> {
        match self.api.delete_child(key).await {
            Ok(()) => Ok(ChildAction::Deleted),
            Err(e) if e.is_not_found() => Ok(ChildAction::AlreadyAbsent),
            Err(e) => Err(e)?,
        }
    }

    async fn write_status_best_effort(
        &self,
        key: &NamespacedName,
        condition: Condition,
        revision: Option<String>,
        report: &mut ReconcileReport,
    ) {
        if let Err(e) = self.write_status(key, condition, revision).await {
            report
                .warnings
                .push(format!("failed to update status of {}: {}", key, e));
        }
    }

    /// Writes the status only if it differs from what the parent currently carries.
    async fn write_status(
        &self,
        key: &NamespacedName,
        condition: Condition,
        revision: Option<String>,
    ) -> Result<(), ControllerError> {
        let latest = self.api.get_parent(key).await?;
        if latest.is_deleted() {
            return Ok(());
        }
        let current = latest.status.clone().unwrap_or_default();
        let mut status: MyWebAppStatus = current.clone();
        status.update_condition(condition);
        if revision.is_some() {
            status.last_reconciled_revision = revision;
        }
        let patch = diff(
            &serde_json::to_value(&current)?,
            &serde_json::to_value(&status)?,
        );
        if !patch.0.is_empty() {
            self.api.patch_parent_status(key, &status).await?;
        }
        Ok(())
    }
}
