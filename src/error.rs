use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SepiaError>;

#[derive(Debug, Error)]
pub enum SepiaError {
    #[error("database is closed")]
    Closed,
    #[error("event type cannot be empty")]
    EmptyType,
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("event not found")]
    NotFound,
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("too many values for percentile calculation")]
    TooManyValues,
    #[error("operation cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for SepiaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<csv::Error> for SepiaError {
    fn from(err: csv::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
