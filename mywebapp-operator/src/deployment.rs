use crate::{
    configuration::SpecDefaults, errors::ControllerError, utils::NamespacedName,
    MANAGED_BY_LABEL, MANAGER,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use mywebapp_operator_apis::{MyWebApp, PARENT_ANNOTATION};
use std::collections::BTreeMap;

const APP_LABEL: &'static str = "app";
/// Label values are limited to 63 characters.
const MAX_LABEL_VALUE_LEN: usize = 63;

/// The Deployment a `MyWebApp` should own, derived from its spec with defaults applied.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ChildDescriptor {
    pub key: NamespacedName,
    pub replicas: i32,
    pub image: String,
    owner: Option<OwnerReference>,
}

impl ChildDescriptor {
    pub fn derive(parent: &MyWebApp, defaults: &SpecDefaults) -> Result<Self, ControllerError> {
        let key = NamespacedName::from(parent);
        if !key.is_valid() {
            return Err(ControllerError::Contract(format!(
                "MyWebApp without namespace or name: {:?}",
                key
            )));
        }
        if key.name.len() > MAX_LABEL_VALUE_LEN {
            return Err(ControllerError::InvalidSpec(format!(
                "name {} is longer than {} characters and cannot be used as label value",
                key.name, MAX_LABEL_VALUE_LEN
            )));
        }
        let replicas = parent.spec.replicas.unwrap_or(defaults.replicas);
        if replicas < 0 {
            return Err(ControllerError::InvalidSpec(format!(
                "spec.replicas must not be negative, got {}",
                replicas
            )));
        }
        let image = parent
            .spec
            .image
            .clone()
            .unwrap_or_else(|| defaults.image.clone());
        if image.trim().is_empty() {
            return Err(ControllerError::InvalidSpec(
                "spec.image must not be empty".to_string(),
            ));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ControllerError::InvalidSpec(format!(
                "spec.image {:?} must not contain whitespace",
                image
            )));
        }
        Ok(Self {
            key,
            replicas,
            image,
            owner: parent.controller_owner_ref(&()),
        })
    }

    fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.key.name.clone())])
    }

    /// Render the Deployment object to create or apply.
    pub fn to_deployment(&self) -> Deployment {
        let mut labels = self.selector_labels();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
        Deployment {
            metadata: ObjectMeta {
                name: Some(self.key.name.clone()),
                namespace: Some(self.key.namespace.clone()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    PARENT_ANNOTATION.to_string(),
                    self.key.to_string(),
                )])),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.selector_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.key.name.clone(),
                            image: Some(self.image.clone()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Whether `actual` already matches everything the operator owns on the
    /// Deployment. Any difference is drift to be overwritten.
    pub fn is_satisfied_by(&self, actual: &Deployment) -> bool {
        let Some(spec) = actual.spec.as_ref() else {
            return false;
        };
        let selector = self.selector_labels();
        let template_labels_match = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref())
            .map_or(false, |labels| {
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            });
        let image_matches = spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == self.key.name))
            .map_or(false, |c| c.image.as_deref() == Some(self.image.as_str()));
        spec.replicas.unwrap_or(1) == self.replicas
            && spec.selector.match_labels.as_ref() == Some(&selector)
            && template_labels_match
            && image_matches
            && is_owned_by(actual, &self.key)
            && actual.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGER)
    }
}

/// Whether the Deployment was created by the operator for the given `MyWebApp`.
pub(crate) fn is_owned_by(child: &Deployment, parent: &NamespacedName) -> bool {
    child
        .annotations()
        .get(PARENT_ANNOTATION)
        .map_or(false, |v| *v == parent.to_string())
}

/// The `MyWebApp` a managed Deployment belongs to.
pub(crate) fn owner_of(child: &Deployment) -> Option<NamespacedName> {
    child
        .annotations()
        .get(PARENT_ANNOTATION)
        .and_then(|v| NamespacedName::parse(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mywebapp_operator_apis::MyWebAppSpec;

    fn webapp(replicas: Option<i32>, image: Option<&str>) -> MyWebApp {
        let mut app = MyWebApp::new(
            "shop",
            MyWebAppSpec {
                replicas,
                image: image.map(|v| v.to_string()),
            },
        );
        app.metadata.namespace = Some("web".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app
    }

    #[test]
    fn defaults_are_applied() {
        let child = ChildDescriptor::derive(&webapp(None, None), &SpecDefaults::default()).unwrap();
        assert_eq!(1, child.replicas);
        assert_eq!("nginx:latest", child.image);
        assert_eq!(NamespacedName::new("web", "shop"), child.key);
    }

    #[test]
    fn declared_values_win() {
        let child = ChildDescriptor::derive(&webapp(Some(3), Some("httpd:2")), &SpecDefaults::default())
            .unwrap();
        assert_eq!(3, child.replicas);
        assert_eq!("httpd:2", child.image);
        let zero = ChildDescriptor::derive(&webapp(Some(0), None), &SpecDefaults::default()).unwrap();
        assert_eq!(0, zero.replicas);
    }

    #[test]
    fn invalid_specs() {
        let defaults = SpecDefaults::default();
        for app in [
            webapp(Some(-1), None),
            webapp(None, Some("")),
            webapp(None, Some("  ")),
            webapp(None, Some("nginx latest")),
        ] {
            match ChildDescriptor::derive(&app, &defaults) {
                Err(ControllerError::InvalidSpec(_)) => (),
                other => panic!("expected invalid spec, got {:?}", other),
            }
        }
        let mut no_namespace = webapp(None, None);
        no_namespace.metadata.namespace = None;
        assert!(matches!(
            ChildDescriptor::derive(&no_namespace, &defaults),
            Err(ControllerError::Contract(_))
        ));
    }

    #[test]
    fn rendered_deployment() {
        let child = ChildDescriptor::derive(&webapp(Some(3), None), &SpecDefaults::default()).unwrap();
        let d = child.to_deployment();
        assert_eq!(Some("shop"), d.metadata.name.as_deref());
        assert_eq!(Some("web"), d.metadata.namespace.as_deref());
        assert_eq!(Some(&MANAGER.to_string()), d.labels().get(MANAGED_BY_LABEL));
        assert_eq!(Some(&"web/shop".to_string()), d.annotations().get(PARENT_ANNOTATION));
        let owner = &d.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!("MyWebApp", owner.kind);
        assert_eq!("uid-1", owner.uid);
        assert_eq!(Some(true), owner.controller);
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(Some(3), spec.replicas);
        assert_eq!(
            Some(&"shop".to_string()),
            spec.selector.match_labels.as_ref().unwrap().get("app")
        );
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(Some("nginx:latest"), container.image.as_deref());
        assert!(child.is_satisfied_by(&d));
        assert!(is_owned_by(&d, &NamespacedName::new("web", "shop")));
        assert!(!is_owned_by(&d, &NamespacedName::new("web", "other")));
        assert_eq!(Some(NamespacedName::new("web", "shop")), owner_of(&d));
    }

    #[test]
    fn drift_is_detected() {
        let child = ChildDescriptor::derive(&webapp(Some(3), None), &SpecDefaults::default()).unwrap();

        let mut scaled = child.to_deployment();
        scaled.spec.as_mut().unwrap().replicas = Some(7);
        assert!(!child.is_satisfied_by(&scaled));

        let mut retagged = child.to_deployment();
        retagged.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
            Some("nginx:1.0".to_string());
        assert!(!child.is_satisfied_by(&retagged));

        let mut foreign = child.to_deployment();
        foreign.metadata.annotations = None;
        assert!(!child.is_satisfied_by(&foreign));

        let mut server_fields = child.to_deployment();
        server_fields.metadata.resource_version = Some("99".to_string());
        server_fields.metadata.uid = Some("d-uid".to_string());
        server_fields.spec.as_mut().unwrap().revision_history_limit = Some(10);
        assert!(child.is_satisfied_by(&server_fields));

        assert!(!child.is_satisfied_by(&Deployment::default()));
    }
}
