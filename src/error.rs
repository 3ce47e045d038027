use thiserror::Error;

use crate::environment::BoxError;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to fetch payload for item {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Dedup lookup failed for item {key}: {source}")]
    Dedup {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to submit item {key}: {source}")]
    Submit {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to query status of {remote_id}: {source}")]
    Status {
        remote_id: String,
        #[source]
        source: BoxError,
    },

    #[error("Received unknown status code from target: {code}")]
    UnknownStatus { code: u16 },

    #[error("Item {key} is {size} bytes, larger than max item size {max}")]
    ItemTooLarge { key: String, size: u64, max: u64 },

    #[error("Item {0} is in flight but has no remote id")]
    MissingRemoteId(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UploadError>;
