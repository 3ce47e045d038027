//! Collaborator interfaces the scheduler drives.
//!
//! - [`SourceEnvironment`]: where item payloads come from (filesystem,
//!   database, remote API). May expose a [`Deduplicator`] to recognise
//!   items submitted by an earlier run.
//! - [`TargetEnvironment`]: the ledger being written to. Accepts payloads and
//!   reports their status.
//!
//! Retry and backoff for individual calls belong to the implementations; any
//! error they return aborts the upload.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};

/// Error type returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identifier the target assigns to an accepted submission.
pub type RemoteId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

/// Submission content for a single item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl Payload {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Target-side status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    NotFound,
    Accepted,
    Confirmed { confirmations: u64 },
}

impl TargetStatus {
    /// Map an HTTP-style status code to a status.
    ///
    /// `200` must carry a confirmation count; `202` is accepted and `404`
    /// not found. Anything else is a protocol violation.
    pub fn from_code(code: u16, confirmations: Option<u64>) -> Result<Self> {
        match (code, confirmations) {
            (200, Some(confirmations)) => Ok(TargetStatus::Confirmed { confirmations }),
            (202, _) => Ok(TargetStatus::Accepted),
            (404, _) => Ok(TargetStatus::NotFound),
            _ => Err(UploadError::UnknownStatus { code }),
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetStatus::NotFound => write!(f, "not found"),
            TargetStatus::Accepted => write!(f, "accepted"),
            TargetStatus::Confirmed { confirmations } => {
                write!(f, "confirmed ({} confirmations)", confirmations)
            }
        }
    }
}

/// Recognises items already submitted by a previous run.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Return the remote id of an earlier submission of this item, if any.
    async fn existing_id(
        &self,
        key: &str,
        payload: &Payload,
    ) -> std::result::Result<Option<RemoteId>, BoxError>;
}

/// Read side: supplies payloads for item keys.
#[async_trait]
pub trait SourceEnvironment: Send + Sync {
    async fn fetch(&self, key: &str) -> std::result::Result<Payload, BoxError>;

    /// Dedup hook. Sources without one never short-circuit submission.
    fn deduplicator(&self) -> Option<&dyn Deduplicator> {
        None
    }
}

/// Write side: accepts submissions and reports their status.
#[async_trait]
pub trait TargetEnvironment: Send + Sync {
    async fn submit(&self, payload: &Payload) -> std::result::Result<RemoteId, BoxError>;

    async fn status(&self, remote_id: &str) -> std::result::Result<TargetStatus, BoxError>;
}

#[async_trait]
impl<T: SourceEnvironment + ?Sized> SourceEnvironment for Arc<T> {
    async fn fetch(&self, key: &str) -> std::result::Result<Payload, BoxError> {
        (**self).fetch(key).await
    }

    fn deduplicator(&self) -> Option<&dyn Deduplicator> {
        (**self).deduplicator()
    }
}

#[async_trait]
impl<T: TargetEnvironment + ?Sized> TargetEnvironment for Arc<T> {
    async fn submit(&self, payload: &Payload) -> std::result::Result<RemoteId, BoxError> {
        (**self).submit(payload).await
    }

    async fn status(&self, remote_id: &str) -> std::result::Result<TargetStatus, BoxError> {
        (**self).status(remote_id).await
    }
}
