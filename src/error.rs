use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasourceError>;

/// Failures a datasource reports to its caller.
///
/// Only the write path (`save`, `delete`, `clear`) and construction surface
/// these. Read operations degrade to an absence marker instead.
#[derive(Error, Debug)]
pub enum DatasourceError {
    #[error("failed to save: {key}, {message}")]
    Write { key: String, message: String },

    #[error("failed to delete: {key}, {message}")]
    Delete { key: String, message: String },

    #[error("failed to clear: {0}")]
    Clear(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by an object-store client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable: bytes={start}-{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
