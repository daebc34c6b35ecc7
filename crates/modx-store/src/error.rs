use std::fmt;

use modx_core::JobStatus;
use uuid::Uuid;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    SafeTensors(safetensors::SafeTensorError),
    Json(serde_json::Error),
    InvalidData(String),
    /// A job status change the state machine does not allow. `from` is
    /// `None` when the job does not exist.
    InvalidTransition {
        id: Uuid,
        from: Option<JobStatus>,
        to: JobStatus,
    },
    /// The source repository could not supply a layer.
    Fetch(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::SafeTensors(e) => write!(f, "safetensors error: {e}"),
            StoreError::Json(e) => write!(f, "JSON error: {e}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::InvalidTransition { id, from: None, to } => {
                write!(f, "cannot move job {id} to {to}: no such job")
            }
            StoreError::InvalidTransition {
                id,
                from: Some(from),
                to,
            } => write!(f, "cannot move job {id} from {from} to {to}"),
            StoreError::Fetch(msg) => write!(f, "fetch failed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::SafeTensors(e) => Some(e),
            StoreError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<safetensors::SafeTensorError> for StoreError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        StoreError::SafeTensors(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
