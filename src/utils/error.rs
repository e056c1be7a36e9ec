use thiserror::Error;
use std::io;

/// Sync notifier error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    BadDatabase(String),

    #[error("Bad event: {0}")]
    BadEvent(String),

    #[error("Invalid sync token: {0}")]
    BadToken(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn bad_database(msg: impl Into<String>) -> Self {
        Error::BadDatabase(msg.into())
    }
}

/// Sync notifier result type
pub type Result<T> = std::result::Result<T, Error>;
