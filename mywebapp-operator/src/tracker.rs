use crate::{
    cluster_api::ClusterApi,
    errors::ControllerError,
    utils::{with_finalizer, without_finalizer, NamespacedName},
    FINALIZER,
};
use async_trait::async_trait;
use kube::ResourceExt;
use mywebapp_operator_apis::{
    MyWebApp, CHILD_CREATED_ANNOTATION, LAST_OBSERVED_REVISION_ANNOTATION,
};
use serde_json::json;
use std::sync::Arc;

/// What the operator durably knows about the Deployment of one `MyWebApp`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ReconciliationRecord {
    pub child_created: bool,
    pub last_observed_revision: String,
}

/// Durable per-identity record of created children. Records must be written
/// only after the remote write they describe was acknowledged.
#[async_trait]
pub(crate) trait OwnershipTracker: Send + Sync {
    async fn lookup(
        &self,
        key: &NamespacedName,
    ) -> Result<Option<ReconciliationRecord>, ControllerError>;

    async fn record_created(
        &self,
        key: &NamespacedName,
        revision: &str,
    ) -> Result<(), ControllerError>;

    async fn record_deleted(&self, key: &NamespacedName) -> Result<(), ControllerError>;
}

/// Keeps the [`ReconciliationRecord`] on the `MyWebApp` itself: two annotations
/// plus the operator's finalizer, so the record survives restarts without
/// separate storage and the parent cannot disappear before its child is gone.
pub(crate) struct AnnotationTracker {
    api: Arc<dyn ClusterApi>,
}

impl AnnotationTracker {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    fn record_of(parent: &MyWebApp) -> Option<ReconciliationRecord> {
        let annotations = parent.annotations();
        if annotations.get(CHILD_CREATED_ANNOTATION).map(String::as_str) == Some("true") {
            Some(ReconciliationRecord {
                child_created: true,
                last_observed_revision: annotations
                    .get(LAST_OBSERVED_REVISION_ANNOTATION)
                    .cloned()
                    .unwrap_or_default(),
            })
        } else {
            None
        }
    }
}

#[async_trait]
impl OwnershipTracker for AnnotationTracker {
    async fn lookup(
        &self,
        key: &NamespacedName,
    ) -> Result<Option<ReconciliationRecord>, ControllerError> {
        match self.api.get_parent(key).await {
            Ok(parent) => Ok(Self::record_of(&parent)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e)?,
        }
    }

    async fn record_created(
        &self,
        key: &NamespacedName,
        revision: &str,
    ) -> Result<(), ControllerError> {
        // A missing parent is reported as not-found, the caller owns the cleanup.
        let parent = self.api.get_parent(key).await?;
        let expected = ReconciliationRecord {
            child_created: true,
            last_observed_revision: revision.to_string(),
        };
        let finalizers = with_finalizer(parent.finalizers(), FINALIZER);
        if Self::record_of(&parent).as_ref() == Some(&expected) && finalizers.is_none() {
            return Ok(());
        }
        let finalizers = finalizers.unwrap_or_else(|| parent.finalizers().to_vec());
        // The resourceVersion turns the merge patch into a compare-and-swap.
        let patch = json!({
            "metadata": {
                "resourceVersion": parent.resource_version(),
                "annotations": {
                    CHILD_CREATED_ANNOTATION: "true",
                    LAST_OBSERVED_REVISION_ANNOTATION: revision,
                },
                "finalizers": finalizers,
            }
        });
        self.api.patch_parent(key, &patch).await?;
        Ok(())
    }

    async fn record_deleted(&self, key: &NamespacedName) -> Result<(), ControllerError> {
        let parent = match self.api.get_parent(key).await {
            Ok(parent) => parent,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => Err(e)?,
        };
        let annotations = parent.annotations();
        let has_annotations = annotations.contains_key(CHILD_CREATED_ANNOTATION)
            || annotations.contains_key(LAST_OBSERVED_REVISION_ANNOTATION);
        let finalizers = without_finalizer(parent.finalizers(), FINALIZER);
        if !has_annotations && finalizers.is_none() {
            return Ok(());
        }
        let finalizers = finalizers.unwrap_or_else(|| parent.finalizers().to_vec());
        let patch = json!({
            "metadata": {
                "resourceVersion": parent.resource_version(),
                "annotations": {
                    CHILD_CREATED_ANNOTATION: null,
                    LAST_OBSERVED_REVISION_ANNOTATION: null,
                },
                "finalizers": finalizers,
            }
        });
        match self.api.patch_parent(key, &patch).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e)?,
        }
    }
}
