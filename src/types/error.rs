//! Error types for camgate

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for camgate operations
#[derive(Debug, Error)]
pub enum GateError {
    #[error("malformed blob ref: {0}")]
    MalformedRef(String),

    #[error("file is empty")]
    FileEmpty,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt blob: {0}")]
    Corrupt(String),

    #[error("cannot open backing store: {0}")]
    StorageInit(String),

    #[error("downstream store error: {0}")]
    Downstream(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

impl GateError {
    /// Short kind name used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRef(_) => "MalformedRef",
            Self::FileEmpty => "FileEmpty",
            Self::NotFound(_) => "NotFound",
            Self::Corrupt(_) => "Corrupt",
            Self::StorageInit(_) => "StorageInit",
            Self::Downstream(_) => "Downstream",
            Self::EmptyResponse => "EmptyResponse",
            Self::Cancelled => "Cancelled",
            Self::Unsupported(_) => "Unsupported",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
            Self::Database(_) => "Database",
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRef(_) | Self::FileEmpty => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Cancelled
        } else {
            Self::Downstream(err.to_string())
        }
    }
}

/// Result type alias for camgate operations
pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GateError::MalformedRef("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GateError::FileEmpty.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GateError::NotFound("y".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GateError::Downstream("z".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn kind_names_are_short() {
        assert_eq!(GateError::EmptyResponse.kind(), "EmptyResponse");
        assert_eq!(GateError::Corrupt("p".into()).kind(), "Corrupt");
    }
}
