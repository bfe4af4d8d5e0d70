/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn status_code(&self) -> Option<u16>;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            kube::Error::Api(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Typed failure of a single call through the [`crate::cluster_api::ClusterApi`] facade.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency failure or create of an already existing object.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// The API server rejected the object as invalid.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Transport errors and any other unclassified failure.
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Whether retrying the same request later can succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            ApiError::Forbidden(_) | ApiError::Invalid(_) => false,
            _ => true,
        }
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        let message = e.to_string();
        if e.is_not_found() {
            return ApiError::NotFound(message);
        }
        if e.is_conflict() {
            return ApiError::Conflict(message);
        }
        match e.status_code() {
            Some(429) => ApiError::RateLimited(message),
            Some(403) => ApiError::Forbidden(message),
            Some(400) | Some(422) => ApiError::Invalid(message),
            Some(408) | Some(504) => ApiError::Timeout(message),
            _ => ApiError::Other(message),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// A call through the cluster API facade failed.
    #[error("{0}")]
    Api(#[from] ApiError),
    /// The declared spec cannot be turned into a Deployment. Retrying the same
    /// input cannot succeed, only a new revision of the spec can.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    /// A Deployment of the same name exists but is not managed by the operator.
    #[error("child conflict: {0}")]
    ChildConflict(String),
    /// An internal invariant was violated (e.g. an event without identity).
    #[error("contract violation: {0}")]
    Contract(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Api(e) => e.is_transient(),
            ControllerError::InvalidSpec(_) => false,
            ControllerError::ChildConflict(_) => false,
            ControllerError::Contract(_) => false,
            ControllerError::Serde(_) => false,
            ControllerError::Any(_) => true,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Api(e) if e.is_not_found())
    }
}
