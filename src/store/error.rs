use std::time::Duration;

use crate::model::RecordId;

#[derive(Debug)]
pub enum StoreError {
    /// The store asked us to slow down, optionally saying for how long.
    Throttled { retry_after: Option<Duration> },
    NotFound(RecordId),
    LimitExceeded(&'static str),
    Backend(String),
    WalError(String),
    /// Still throttled after the retry ceiling.
    RetriesExhausted { attempts: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Throttled {
                retry_after: Some(d),
            } => write!(f, "throttled: retry after {}ms", d.as_millis()),
            StoreError::Throttled { retry_after: None } => write!(f, "throttled"),
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Backend(msg) => write!(f, "store error: {msg}"),
            StoreError::WalError(msg) => write!(f, "WAL error: {msg}"),
            StoreError::RetriesExhausted { attempts } => {
                write!(f, "still throttled after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for StoreError {}
