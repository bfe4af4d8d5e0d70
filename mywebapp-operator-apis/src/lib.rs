use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation on an owned Deployment pointing back to its `MyWebApp` (`{namespace}/{name}`).
pub const PARENT_ANNOTATION: &'static str = "mycompany.com/parent";

/// Annotation on a `MyWebApp` recording that its Deployment has been created.
pub const CHILD_CREATED_ANNOTATION: &'static str = "mycompany.com/child-created";

/// Annotation on a `MyWebApp` recording the last spec revision the operator reconciled.
pub const LAST_OBSERVED_REVISION_ANNOTATION: &'static str =
    "mycompany.com/last-observed-revision";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Declared state of a web application, materialized by the operator as a
/// single Deployment with the same name and namespace.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mycompany.com",
    version = "v1",
    kind = "MyWebApp",
    derive = "PartialEq",
    status = "MyWebAppStatus",
    shortname = "webapp",
    namespaced,
    printcolumn = r#"{
        "name":"Replicas",
        "type": "integer",
        "jsonPath": ".spec.replicas",
        "description": "Desired number of replicas."
    }"#,
    printcolumn = r#"{
        "name":"Image",
        "type": "string",
        "jsonPath": ".spec.image",
        "description": "Container image of the web application."
    }"#,
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status",
        "description": "Whether the Deployment reflects the latest spec."
    }"#
)]
pub struct MyWebAppSpec {
    /// Number of pod replicas, defaults to the operator's configured default (1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub replicas: Option<i32>,
    /// Container image, defaults to the operator's configured default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct MyWebAppStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// The spec revision (`metadata.generation`) the Deployment was last reconciled against.
    #[serde(
        rename = "lastReconciledRevision",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_reconciled_revision: Option<String>,
}

impl MyWebApp {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }

    /// The revision of the declared spec. `metadata.generation` only moves on
    /// spec changes, so status and annotation writes do not change it.
    pub fn spec_revision(&self) -> String {
        match (
            self.metadata.generation,
            self.metadata.resource_version.as_deref(),
        ) {
            (Some(generation), _) => generation.to_string(),
            (None, Some(rv)) => rv.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.condition(tpe))
    }

    pub fn update_condition(&mut self, c: Condition) {
        let mut status = self.status.take().unwrap_or_default();
        status.update_condition(c);
        self.status = Some(status);
    }
}

impl MyWebAppStatus {
    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == tpe))
    }

    /// Replace the condition of the same type, keeping the existing one (and its
    /// transition time) when nothing but the timestamp would change.
    pub fn update_condition(&mut self, mut c: Condition) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_default();
        let unchanged = conditions
            .iter()
            .any(|existing| existing.type_ == c.type_ && existing.same_state(&c));
        if !unchanged {
            let time = Utc::now();
            c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
            conditions.retain(|v| v.type_ != c.type_);
            conditions.push(c);
        }
        self.conditions = Some(conditions);
    }
}
