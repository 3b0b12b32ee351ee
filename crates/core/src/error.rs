use thiserror::Error;

/// Failures reported by the managed object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not_found: {resource} {namespace}/{name}")]
    NotFound { resource: String, namespace: String, name: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors surfaced through the shadow-resource CRUD contract.
///
/// Store failures pass through unchanged; a component batch that fails
/// midway is reported as the `Store` error of the failing component.
#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("resolution: no resource mapping for kind {kind} in {api_version}")]
    Resolution { api_version: String, kind: String },
    #[error("not_found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ShadowError {
    pub fn not_found(namespace: &str, name: &str) -> Self {
        ShadowError::NotFound { namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ShadowError::NotFound { .. } => true,
            ShadowError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type ShadowResult<T> = Result<T, ShadowError>;
