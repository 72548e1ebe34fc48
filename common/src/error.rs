use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conversion error: {0}")]
    Conversion(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Upstream rejected request: {0}")]
    UpstreamRejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not ready: {0}")]
    NotReady(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, the contract surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conversion(_) => "conversion_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotReady(_) => "not_ready",
            _ => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping_is_stable() {
        assert_eq!(AppError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(AppError::Conversion("x".into()).kind(), "conversion_error");
        assert_eq!(
            AppError::UpstreamUnavailable("x".into()).kind(),
            "upstream_unavailable"
        );
        assert_eq!(
            AppError::UpstreamRejected("x".into()).kind(),
            "upstream_rejected"
        );
        assert_eq!(AppError::NotReady("x".into()).kind(), "not_ready");
        assert_eq!(
            AppError::Internal("x".into()).kind(),
            "internal_error"
        );
    }
}
