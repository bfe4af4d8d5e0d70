use crate::{errors::ApiError, utils::NamespacedName, MANAGED_BY_LABEL, MANAGER};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use mywebapp_operator_apis::{MyWebApp, MyWebAppStatus};
use std::{future::Future, time::Duration};
use tokio::time::timeout;

/// Thin capability over the cluster API for the two resource types the
/// operator touches. No business logic lives behind this trait.
#[async_trait]
pub(crate) trait ClusterApi: Send + Sync {
    async fn get_parent(&self, key: &NamespacedName) -> Result<MyWebApp, ApiError>;

    /// JSON merge patch of a `MyWebApp`, used for annotations and finalizers.
    async fn patch_parent(
        &self,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> Result<MyWebApp, ApiError>;

    /// Write the status subresource of a `MyWebApp`.
    async fn patch_parent_status(
        &self,
        key: &NamespacedName,
        status: &MyWebAppStatus,
    ) -> Result<(), ApiError>;

    async fn get_child(&self, key: &NamespacedName) -> Result<Deployment, ApiError>;

    /// All Deployments carrying the operator's managed-by label.
    async fn list_children(&self) -> Result<Vec<Deployment>, ApiError>;

    async fn create_child(&self, child: &Deployment) -> Result<Deployment, ApiError>;

    /// Patch a Deployment in place; fields owned by the operator are overwritten.
    async fn patch_child(
        &self,
        key: &NamespacedName,
        child: &Deployment,
    ) -> Result<Deployment, ApiError>;

    async fn delete_child(&self, key: &NamespacedName) -> Result<(), ApiError>;
}

/// [`ClusterApi`] backed by a [`kube::Client`]; every call is bounded by a timeout.
#[derive(Clone)]
pub(crate) struct KubeClusterApi {
    client: Client,
    timeout: Duration,
    /// Restricts [`ClusterApi::list_children`] to a single namespace.
    namespace: Option<String>,
}

impl KubeClusterApi {
    pub fn new(client: Client, timeout: Duration, namespace: Option<String>) -> Self {
        Self {
            client,
            timeout,
            namespace,
        }
    }

    fn webapps(&self, namespace: &str) -> Api<MyWebApp> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T, F>(
        &self,
        what: &str,
        key: &(dyn std::fmt::Display + Sync),
        f: F,
    ) -> Result<T, ApiError>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        match timeout(self.timeout, f).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout(format!(
                "{} {} did not complete within {:?}",
                what, key, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_parent(&self, key: &NamespacedName) -> Result<MyWebApp, ApiError> {
        let api = self.webapps(&key.namespace);
        self.call("get MyWebApp", key, api.get(&key.name)).await
    }

    async fn patch_parent(
        &self,
        key: &NamespacedName,
        patch: &serde_json::Value,
    ) -> Result<MyWebApp, ApiError> {
        let api = self.webapps(&key.namespace);
        let pp = PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };
        self.call(
            "patch MyWebApp",
            key,
            api.patch(&key.name, &pp, &Patch::Merge(patch)),
        )
        .await
    }

    async fn patch_parent_status(
        &self,
        key: &NamespacedName,
        status: &MyWebAppStatus,
    ) -> Result<(), ApiError> {
        let api = self.webapps(&key.namespace);
        let pp = PatchParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        };
        let patch = serde_json::json!({ "status": status });
        self.call(
            "patch MyWebApp status",
            key,
            api.patch_status(&key.name, &pp, &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }

    async fn get_child(&self, key: &NamespacedName) -> Result<Deployment, ApiError> {
        let api = self.deployments(&key.namespace);
        self.call("get Deployment", key, api.get(&key.name)).await
    }

    async fn list_children(&self) -> Result<Vec<Deployment>, ApiError> {
        let api: Api<Deployment> = match &self.namespace {
            Some(ns) => self.deployments(ns),
            None => Api::all(self.client.clone()),
        };
        let lp = ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGER));
        let scope = self.namespace.as_deref().unwrap_or("*");
        self.call("list Deployments", &scope, api.list(&lp))
            .await
            .map(|list| list.items)
    }

    async fn create_child(&self, child: &Deployment) -> Result<Deployment, ApiError> {
        let namespace = child.namespace().unwrap_or_default();
        let api = self.deployments(&namespace);
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        let key = NamespacedName::new(&namespace, &child.name_any());
        self.call("create Deployment", &key, api.create(&pp, child))
            .await
    }

    async fn patch_child(
        &self,
        key: &NamespacedName,
        child: &Deployment,
    ) -> Result<Deployment, ApiError> {
        let api = self.deployments(&key.namespace);
        // Server-side apply with force takes back ownership of fields changed by others.
        let pp = PatchParams::apply(MANAGER).force();
        self.call(
            "patch Deployment",
            key,
            api.patch(&key.name, &pp, &Patch::Apply(child)),
        )
        .await
    }

    async fn delete_child(&self, key: &NamespacedName) -> Result<(), ApiError> {
        let api = self.deployments(&key.namespace);
        self.call(
            "delete Deployment",
            key,
            api.delete(&key.name, &DeleteParams::background()),
        )
        .await
        .map(|_| ())
    }
}
