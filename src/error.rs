use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Render an error together with every `source()` below it, one cause per
/// line, so a single log line carries the whole chain down to the root.
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = err.to_string();
    let mut cause = err.source();
    while let Some(current) = cause {
        output.push_str("\n  caused by: ");
        output.push_str(&current.to_string());
        cause = current.source();
    }
    output
}

/// Central application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Kubernetes config error: {0}")]
    KubernetesConfig(String),

    /// Source fetching errors
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image registry error: {0}")]
    Registry(String),

    /// A source kind no registered unpacker handles
    #[error("source type {0:?} not supported")]
    SourceTypeUnsupported(String),

    /// Bundle content errors
    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Release/apply errors
    #[error("Install failed: {0}")]
    Install(String),

    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    /// Required CRDs (or other kinds) are missing from the cluster
    #[error("required resource not found: {0}")]
    RequiredResourceNotFound(String),

    /// The stored release could not be read back
    #[error("Error getting release state: {0}")]
    ReleaseState(String),

    /// Hotloop protection: too many live Bundles for one BundleDeployment
    #[error("cannot create more than {0} bundles for this deployment, please delete the stale ones manually")]
    MaxGeneratedLimit(usize),

    /// Serialization/Deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors with context
    #[error("Internal error: {0}")]
    Internal(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A pinned artifact (digest reference, immutable content) failed to resolve.
    /// Retrying cannot help; the spec has to change.
    #[error("unrecoverable: {0}")]
    Unrecoverable(Box<AppError>),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Wrap an error so the reconciler stops requeueing it with backoff.
    pub fn unrecoverable(err: AppError) -> AppError {
        match err {
            AppError::Unrecoverable(_) => err,
            other => AppError::Unrecoverable(Box::new(other)),
        }
    }

    /// True when a requeue cannot change the outcome without a spec change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppError::Unrecoverable(_)
                | AppError::MaxGeneratedLimit(_)
                | AppError::SourceTypeUnsupported(_)
                | AppError::InvalidInput(_)
        )
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        log::error!("HTTP error response: {}", self);

        let status_code = self.status_code();
        let error_message = self.to_string();

        let body = serde_json::json!({
            "error": error_message,
            "status": status_code.as_u16(),
        });

        HttpResponse::build(status_code)
            .content_type("application/json")
            .json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types that don't have automatic conversion
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_does_not_double_wrap() {
        let err = AppError::unrecoverable(AppError::Registry("digest gone".into()));
        let err = AppError::unrecoverable(err);
        match err {
            AppError::Unrecoverable(inner) => {
                assert!(matches!(*inner, AppError::Registry(_)))
            }
            other => panic!("expected Unrecoverable, got {other:?}"),
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(AppError::MaxGeneratedLimit(4).is_terminal());
        assert!(AppError::SourceTypeUnsupported("smb".into()).is_terminal());
        assert!(!AppError::Validation("still unpacking".into()).is_terminal());
        assert!(!AppError::RequiredResourceNotFound("Foo".into()).is_terminal());
    }

    #[test]
    fn error_chain_keeps_every_cause() {
        let err = AppError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "manifests/ is missing",
        ));
        let rendered = format_error_chain(&err);
        assert!(rendered.starts_with("I/O error:"));
        assert!(rendered.contains("caused by: manifests/ is missing"));
    }
}
