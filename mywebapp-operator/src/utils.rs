use kube::ResourceExt;
use mywebapp_operator_apis::MyWebApp;

/// Identity of a `MyWebApp` and, by convention, of its Deployment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&MyWebApp> for NamespacedName {
    fn from(o: &MyWebApp) -> Self {
        Self {
            name: o.name_any(),
            namespace: o.namespace().unwrap_or_else(|| "".to_string()),
        }
    }
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse the `{namespace}/{name}` form used in annotations.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split("/").collect();
        match parts.as_slice() {
            [ns, name] if !ns.is_empty() && !name.is_empty() => Some(Self::new(ns, name)),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }
}

/// Returns the finalizers with `finalizer` appended if missing, `None` if it is already present.
pub(crate) fn with_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if finalizers.iter().any(|f| f.as_str() == finalizer) {
        None
    } else {
        let mut finalizers = finalizers.to_vec();
        finalizers.push(finalizer.to_string());
        Some(finalizers)
    }
}

/// Returns the finalizers without `finalizer`, `None` if it was not present.
pub(crate) fn without_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    let len = finalizers.len();
    let retained: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    if retained.len() != len {
        Some(retained)
    } else {
        None
    }
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("mywebapp_operator_{}", name)
}
