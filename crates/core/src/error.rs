use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// No database connection freed up within the lock-wait window.
    #[error("Store connection pool exhausted: {0}")]
    StorePoolExhausted(String),

    /// No automation session slot freed up within the acquire timeout.
    #[error("Session pool exhausted: {0}")]
    SessionPoolExhausted(String),

    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Informational: a sync cycle resolved a two-sided edit. Never fatal.
    #[error("Sync conflict on record {0}")]
    SyncConflict(String),

    #[error("Remote replica error: {0}")]
    Remote(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
