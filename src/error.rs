//! Error types for the mesh operator
//!
//! Every level of the reconciliation engine (object, component, control plane)
//! collects child failures into an [`AggregateError`] instead of short-circuiting,
//! so a single broken object never prevents its siblings from being reconciled.

use std::fmt;

use thiserror::Error;

/// Main error type for mesh operator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object does not exist in the cluster
    #[error("not found: {0}")]
    NotFound(String),

    /// Object is gone (HTTP 410)
    #[error("gone: {0}")]
    Gone(String),

    /// Optimistic concurrency failure (resourceVersion mismatch)
    #[error("conflict: {0}")]
    Conflict(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A rendered manifest could not be decoded into an object
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// The live and desired objects could not be diffed
    #[error("Patch error: {0}")]
    PatchError(String),

    /// An extension hook failed
    #[error("Hook error: {0}")]
    HookError(String),

    /// Finalizer could not be added or removed
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Invalid operator or engine configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Manifest rendering failed
    #[error("Render error: {0}")]
    RenderError(String),

    /// Zero or more failures collected during a pass
    #[error("{0}")]
    Aggregate(AggregateError),
}

/// Result type alias for mesh operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    /// True for HTTP 404 or an explicit [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || self.api_code() == Some(404)
    }

    /// True for HTTP 410 or an explicit [`Error::Gone`]
    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Gone(_)) || self.api_code() == Some(410)
    }

    /// True for HTTP 409 or an explicit [`Error::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_)) || self.api_code() == Some(409)
    }

    /// Deleting something that is already absent counts as success
    pub fn is_absent(&self) -> bool {
        self.is_not_found() || self.is_gone()
    }

    /// Whether the controller should retry quickly
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::Conflict(_) | Error::Gone(_) => true,
            Error::Aggregate(agg) => agg.errors().iter().any(Error::is_retriable),
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::Gone(_) => "gone",
            Error::Conflict(_) => "conflict",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::ManifestError(_) => "manifest",
            Error::PatchError(_) => "patch",
            Error::HookError(_) => "hook",
            Error::FinalizerError(_) => "finalizer",
            Error::ConfigError(_) => "config",
            Error::RenderError(_) => "render",
            Error::Aggregate(_) => "aggregate",
        }
    }
}

/// A combined error representing several underlying failures
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error, flattening nested aggregates
    pub fn push(&mut self, err: Error) {
        match err {
            Error::Aggregate(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// Record the error of a result, if any
    pub fn collect(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.push(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, the single error when exactly one did,
    /// an [`Error::Aggregate`] otherwise
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Aggregate(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", messages.join(", "))
    }
}

impl FromIterator<Error> for AggregateError {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        let mut agg = AggregateError::new();
        for err in iter {
            agg.push(err);
        }
        agg
    }
}
