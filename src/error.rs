use thiserror::Error;

/// Typed application error hierarchy for scheduler and storage operations.
///
/// Serializes as a plain string so callers polling task state can forward
/// `error.to_string()` without caring about the variant, while Rust code can
/// still match or propagate with `?`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {0} is already registered")]
    AlreadyRegistered(i64),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Error raised by a stage backend (LLM call, subprocess, local model).
///
/// The variant decides what the stage runner does next: transient errors are
/// retried and then answered by the stage's local fallback, permanent and
/// invalid-input errors fail the task immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Permanent(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("cancelled")]
    Cancelled,
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return BackendError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                BackendError::Transient(e.to_string())
            }
            Some(_) => BackendError::Permanent(e.to_string()),
            None => BackendError::Transient(e.to_string()),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::Invalid(e.to_string()),
            _ => BackendError::Permanent(e.to_string()),
        }
    }
}
