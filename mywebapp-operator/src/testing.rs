//! In-memory [`ClusterApi`] used by the unit tests.

use crate::{cluster_api::ClusterApi, errors::ApiError, utils::NamespacedName, MANAGED_BY_LABEL};
use async_trait::async_trait;
use k8s_openapi::{api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::ResourceExt;
use mywebapp_operator_apis::{MyWebApp, MyWebAppSpec, MyWebAppStatus};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
};

/// Number of calls per facade operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub parent_gets: usize,
    pub parent_patches: usize,
    pub status_patches: usize,
    pub child_gets: usize,
    pub child_lists: usize,
    pub child_creates: usize,
    pub child_patches: usize,
    pub child_deletes: usize,
}

impl Counters {
    /// Writes against Deployments plus writes against `MyWebApp`s.
    pub fn writes(&self) -> usize {
        self.parent_patches
            + self.status_patches
            + self.child_creates
            + self.child_patches
            + self.child_deletes
    }
}

#[derive(Default)]
struct State {
    resource_version: u64,
    parents: BTreeMap<NamespacedName, MyWebApp>,
    children: BTreeMap<NamespacedName, Deployment>,
    counters: Counters,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn injected_failure(&mut self, op: &'static str) -> Result<(), ApiError> {
        match self.failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Store a parent, bumping resourceVersion and (on spec change) generation.
    /// Deleting parents without finalizers are removed.
    fn store_parent(&mut self, key: &NamespacedName, mut parent: MyWebApp) -> MyWebApp {
        let previous = self.parents.get(key);
        let generation = match previous {
            Some(p) if p.spec == parent.spec => p.metadata.generation.unwrap_or(1),
            Some(p) => p.metadata.generation.unwrap_or(1) + 1,
            None => 1,
        };
        parent.metadata.generation = Some(generation);
        parent.metadata.resource_version = Some(self.next_resource_version());
        if parent.metadata.deletion_timestamp.is_some() && parent.finalizers().is_empty() {
            self.parents.remove(key);
        } else {
            self.parents.insert(key.clone(), parent.clone());
        }
        parent
    }
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Create or update a parent the way a user would (`kubectl apply`).
    pub fn apply_parent(
        &self,
        key: &NamespacedName,
        replicas: Option<i32>,
        image: Option<&str>,
    ) -> MyWebApp {
        let mut state = self.state();
        let spec = MyWebAppSpec {
            replicas,
            image: image.map(|v| v.to_string()),
        };
        let parent = match state.parents.get(key) {
            Some(existing) => {
                let mut p = existing.clone();
                p.spec = spec;
                p
            }
            None => {
                let mut p = MyWebApp::new(&key.name, spec);
                p.metadata.namespace = Some(key.namespace.clone());
                p.metadata.uid = Some(format!("uid-{}", key));
                p
            }
        };
        state.store_parent(key, parent)
    }

    /// Delete a parent the way a user would; finalizers keep it around.
    pub fn delete_parent(&self, key: &NamespacedName) {
        let mut state = self.state();
        if let Some(mut parent) = state.parents.get(key).cloned() {
            if parent.metadata.deletion_timestamp.is_none() {
                parent.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            state.store_parent(key, parent);
        }
    }

    /// Merge patch a parent without preconditions or counters.
    pub fn patch_parent_directly(&self, key: &NamespacedName, patch: serde_json::Value) {
        let mut state = self.state();
        if let Some(parent) = state.parents.get(key).cloned() {
            let mut doc = serde_json::to_value(&parent).unwrap();
            json_patch::merge(&mut doc, &patch);
            let parent: MyWebApp = serde_json::from_value(doc).unwrap();
            state.store_parent(key, parent);
        }
    }

    pub fn parent(&self, key: &NamespacedName) -> Option<MyWebApp> {
        self.state().parents.get(key).cloned()
    }

    pub fn child(&self, key: &NamespacedName) -> Option<Deployment> {
        self.state().children.get(key).cloned()
    }

    pub fn child_replicas(&self, key: &NamespacedName) -> Option<i32> {
        self.child(key)
            .and_then(|d| d.spec)
            .and_then(|s| s.replicas)
    }

    pub fn child_image(&self, key: &NamespacedName) -> Option<String> {
        self.child(key)
            .and_then(|d| d.spec)
            .and_then(|s| s.template.spec)
            .and_then(|s| s.containers.into_iter().next())
            .and_then(|c| c.image)
    }

    /// Out-of-band change of a child's replica count (e.g. `kubectl scale`).
    pub fn scale_child_directly(&self, key: &NamespacedName, replicas: i32) {
        let mut state = self.state();
        let rv = state.next_resource_version();
        if let Some(child) = state.children.get_mut(key) {
            if let Some(spec) = child.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
            child.metadata.resource_version = Some(rv);
        }
    }

    pub fn insert_child_directly(&self, child: Deployment) {
        let key = NamespacedName::new(&child.namespace().unwrap_or_default(), &child.name_any());
        self.state().children.insert(key, child);
    }

    pub fn remove_child_directly(&self, key: &NamespacedName) {
        self.state().children.remove(key);
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: ApiError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    pub fn counters(&self) -> Counters {
        self.state().counters.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_parent(&self, key: &NamespacedName) -> Result<MyWebApp, ApiError> {
        let mut state = self.state();
        state.counters.parent_gets += 1;
        state.injected_failure("get_parent")?;
        state
            .parents
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("mywebapps {}", key)))
    }

    async fn patch_parent(
        &self,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> Result<MyWebApp, ApiError> {
        let mut state = self.state();
        state.counters.parent_patches += 1;
        state.injected_failure("patch_parent")?;
        let parent = state
            .parents
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("mywebapps {}", key)))?;
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(|v| v.as_str())
        {
            if parent.metadata.resource_version.as_deref() != Some(expected) {
                return Err(ApiError::Conflict(format!(
                    "mywebapps {} has been modified",
                    key
                )));
            }
        }
        let mut doc = serde_json::to_value(&parent).map_err(|e| ApiError::Invalid(e.to_string()))?;
        json_patch::merge(&mut doc, patch);
        let patched: MyWebApp =
            serde_json::from_value(doc).map_err(|e| ApiError::Invalid(e.to_string()))?;
        Ok(state.store_parent(key, patched))
    }

    async fn patch_parent_status(
        &self,
        key: &NamespacedName,
        status: &MyWebAppStatus,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        state.counters.status_patches += 1;
        state.injected_failure("patch_parent_status")?;
        let mut parent = state
            .parents
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("mywebapps {}", key)))?;
        parent.status = Some(status.clone());
        state.store_parent(key, parent);
        Ok(())
    }

    async fn get_child(&self, key: &NamespacedName) -> Result<Deployment, ApiError> {
        let mut state = self.state();
        state.counters.child_gets += 1;
        state.injected_failure("get_child")?;
        state
            .children
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("deployments {}", key)))
    }

    async fn list_children(&self) -> Result<Vec<Deployment>, ApiError> {
        let mut state = self.state();
        state.counters.child_lists += 1;
        state.injected_failure("list_children")?;
        Ok(state
            .children
            .values()
            .filter(|d| d.labels().contains_key(MANAGED_BY_LABEL))
            .cloned()
            .collect())
    }

    async fn create_child(&self, child: &Deployment) -> Result<Deployment, ApiError> {
        let mut state = self.state();
        state.counters.child_creates += 1;
        state.injected_failure("create_child")?;
        let key = NamespacedName::new(&child.namespace().unwrap_or_default(), &child.name_any());
        if state.children.contains_key(&key) {
            return Err(ApiError::Conflict(format!("deployments {} already exists", key)));
        }
        let mut created = child.clone();
        created.metadata.uid = Some(format!("uid-deployment-{}", key));
        created.metadata.resource_version = Some(state.next_resource_version());
        state.children.insert(key, created.clone());
        Ok(created)
    }

    async fn patch_child(
        &self,
        key: &NamespacedName,
        child: &Deployment,
    ) -> Result<Deployment, ApiError> {
        let mut state = self.state();
        state.counters.child_patches += 1;
        state.injected_failure("patch_child")?;
        let rv = state.next_resource_version();
        let existing = state
            .children
            .get_mut(key)
            .ok_or_else(|| ApiError::NotFound(format!("deployments {}", key)))?;
        // Server-assigned fields (uid) survive, operator-owned fields are replaced.
        existing.metadata.labels = child.metadata.labels.clone();
        existing.metadata.annotations = child.metadata.annotations.clone();
        existing.metadata.owner_references = child.metadata.owner_references.clone();
        existing.spec = child.spec.clone();
        existing.metadata.resource_version = Some(rv);
        Ok(existing.clone())
    }

    async fn delete_child(&self, key: &NamespacedName) -> Result<(), ApiError> {
        let mut state = self.state();
        state.counters.child_deletes += 1;
        state.injected_failure("delete_child")?;
        state
            .children
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("deployments {}", key)))
    }
}
