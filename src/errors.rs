use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("LOCK_TIMEOUT: {0}")]
    LockTimeout(String),
    #[error("STORE_UNAVAILABLE: {0}")]
    StoreUnavailable(String),
    #[error("PARTIAL_INGEST: {0}")]
    PartialIngestFailure(String),
    #[error("CORRUPT_STORE: {0}")]
    CorruptStore(String),
    #[error("WRITE_FAILURE: {0}")]
    WriteFailure(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Lock timeouts and store outages skip a cycle; everything else is a real fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::StoreUnavailable(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::PartialIngestFailure(_) => "PARTIAL_INGEST",
            Self::CorruptStore(_) => "CORRUPT_STORE",
            Self::WriteFailure(_) => "WRITE_FAILURE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Rebuilds an error from a recorded `code` and its display string.
    pub fn from_code(code: &str, display: &str) -> Self {
        let message = display
            .strip_prefix(code)
            .and_then(|rest| rest.strip_prefix(": "))
            .unwrap_or(display)
            .to_string();
        match code {
            "LOCK_TIMEOUT" => Self::LockTimeout(message),
            "STORE_UNAVAILABLE" => Self::StoreUnavailable(message),
            "PARTIAL_INGEST" => Self::PartialIngestFailure(message),
            "CORRUPT_STORE" => Self::CorruptStore(message),
            "WRITE_FAILURE" => Self::WriteFailure(message),
            "INVALID_INPUT" => Self::InvalidInput(message),
            "IO_FAILURE" => Self::Io(message),
            "NOT_FOUND" => Self::NotFound(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked)
            | Some(rusqlite::ErrorCode::CannotOpen)
            | Some(rusqlite::ErrorCode::DiskFull)
            | Some(rusqlite::ErrorCode::SystemIoFailure) => Self::StoreUnavailable(value.to_string()),
            Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt) => {
                Self::CorruptStore(value.to_string())
            }
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::InvalidInput(value.to_string()),
            _ => Self::Internal(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
