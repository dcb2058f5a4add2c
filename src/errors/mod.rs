/// Unified error handling module
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Shared error taxonomy used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FileNotFound,
    Permission,
    Network,
    Validation,
    Configuration,
    ExternalTool,
    Processing,
    System,
    Unknown,
}

/// Unified error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
}

#[derive(Debug)]
pub enum ApiError {
    Database(sqlx::Error),
    ExternalApi(reqwest::Error),
    ObjectStore(String),
    Io(std::io::Error),
    NotFound(String),
    DirectoryNotFound(PathBuf),
    InvalidRange(String),
    InvalidInput(String),
    Config(String),
    Render(String),
    Internal(String),
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Database(_) => ErrorCategory::System,
            ApiError::ExternalApi(_) | ApiError::ObjectStore(_) => ErrorCategory::Network,
            ApiError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCategory::FileNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
                _ => ErrorCategory::System,
            },
            ApiError::NotFound(_) | ApiError::DirectoryNotFound(_) => ErrorCategory::FileNotFound,
            ApiError::InvalidRange(_) | ApiError::InvalidInput(_) => ErrorCategory::Validation,
            ApiError::Config(_) => ErrorCategory::Configuration,
            ApiError::Render(_) => ErrorCategory::ExternalTool,
            ApiError::Internal(_) => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Database(e) => write!(f, "Database error: {}", e),
            ApiError::ExternalApi(e) => write!(f, "External API error: {}", e),
            ApiError::ObjectStore(msg) => write!(f, "Object store error: {}", msg),
            ApiError::Io(e) => write!(f, "I/O error: {}", e),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::DirectoryNotFound(path) => {
                write!(f, "Directory not found: {}", path.display())
            }
            ApiError::InvalidRange(msg) => write!(f, "Invalid range: {}", msg),
            ApiError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ApiError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ApiError::Render(msg) => write!(f, "Render error: {}", msg),
            ApiError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::ExternalApi(err)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Io(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.category();
        let (code, message) = match &self {
            ApiError::Database(e) => ("DATABASE_ERROR", e.to_string()),
            ApiError::ExternalApi(e) => {
                if let Some(status) = e.status() {
                    (
                        match status.as_u16() {
                            403 => "UPSTREAM_403",
                            404 => "UPSTREAM_404",
                            429 => "UPSTREAM_429",
                            500..=599 => "UPSTREAM_5XX",
                            _ => "UPSTREAM_ERROR",
                        },
                        format!("External API error: {}", e),
                    )
                } else {
                    ("UPSTREAM_ERROR", format!("External API error: {}", e))
                }
            }
            ApiError::ObjectStore(msg) => ("OBJECT_STORE_ERROR", msg.clone()),
            ApiError::Io(e) => ("IO_ERROR", e.to_string()),
            ApiError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
            ApiError::DirectoryNotFound(_) => ("DIRECTORY_NOT_FOUND", self.to_string()),
            ApiError::InvalidRange(msg) => ("INVALID_RANGE", msg.clone()),
            ApiError::InvalidInput(msg) => ("INVALID_INPUT", msg.clone()),
            ApiError::Config(msg) => ("CONFIG_ERROR", msg.clone()),
            ApiError::Render(msg) => ("RENDER_ERROR", msg.clone()),
            ApiError::Internal(msg) => ("INTERNAL_ERROR", msg.clone()),
        };

        let error_response = ErrorResponse {
            ok: false,
            error: ErrorDetail {
                code: code.to_string(),
                message,
                category,
            },
        };

        // Always return HTTP 200 with ok=false
        (StatusCode::OK, Json(error_response)).into_response()
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;

/// Per-timestamp failure collected by the fetch phase
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{store}: no remote file for {timestamp}")]
    NotFound { store: String, timestamp: String },
    #[error("{store}: network failure: {message}")]
    Network { store: String, message: String },
    #[error("render failed for {path}: {message}")]
    Render { path: PathBuf, message: String },
    #[error("local write failed: {0}")]
    Io(String),
    #[error("fetch task failed: {0}")]
    Internal(String),
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::NotFound { .. } => ErrorCategory::FileNotFound,
            FetchError::Network { .. } => ErrorCategory::Network,
            FetchError::Render { .. } => ErrorCategory::ExternalTool,
            FetchError::Io(_) => ErrorCategory::System,
            FetchError::Internal(_) => ErrorCategory::Unknown,
        }
    }

    /// Only network-class failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network { .. })
    }

    /// Convert a store error into a per-item failure
    pub fn from_store(store: &str, err: ApiError) -> Self {
        match err {
            ApiError::Io(e) => FetchError::Io(e.to_string()),
            ApiError::NotFound(timestamp) => FetchError::NotFound {
                store: store.to_string(),
                timestamp,
            },
            other => FetchError::Network {
                store: store.to_string(),
                message: other.to_string(),
            },
        }
    }
}
