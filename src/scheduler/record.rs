use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::{Payload, RemoteId, TargetStatus};

/// Confirmation count of an item that is unsubmitted or not yet seen in a block.
pub const UNCONFIRMED: i64 = -1;

/// Last status the target reported for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedState {
    NotFound,
    Accepted,
    Confirmed,
}

impl std::fmt::Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservedState::NotFound => write!(f, "not_found"),
            ObservedState::Accepted => write!(f, "accepted"),
            ObservedState::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Partition an item falls into, derived from its state and the
/// confirmation threshold. Every record is in exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Queued,
    Pending,
    Mined,
    Complete,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Queued => write!(f, "queued"),
            Stage::Pending => write!(f, "pending"),
            Stage::Mined => write!(f, "mined"),
            Stage::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: String,
    #[serde(default)]
    pub order_tier: u32,
    pub remote_id: Option<RemoteId>,
    pub confirmations: i64,
    pub state: ObservedState,
    #[serde(default)]
    pub byte_size: u64,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fetched lazily, dropped once complete, never persisted.
    #[serde(skip)]
    pub payload: Option<Payload>,
}

impl ItemRecord {
    pub fn new(key: String) -> Self {
        Self::with_tier(key, 0)
    }

    pub fn with_tier(key: String, order_tier: u32) -> Self {
        Self {
            key,
            order_tier,
            remote_id: None,
            confirmations: UNCONFIRMED,
            state: ObservedState::NotFound,
            byte_size: 0,
            submitted_at: None,
            completed_at: None,
            payload: None,
        }
    }

    pub fn stage(&self, confirmations_required: u32) -> Stage {
        match self.state {
            ObservedState::NotFound => Stage::Queued,
            ObservedState::Accepted => Stage::Pending,
            ObservedState::Confirmed if self.confirmations < i64::from(confirmations_required) => {
                Stage::Mined
            }
            ObservedState::Confirmed => Stage::Complete,
        }
    }

    /// Pending or mined: counted against the in-flight quotas.
    pub fn is_in_flight(&self, confirmations_required: u32) -> bool {
        matches!(
            self.stage(confirmations_required),
            Stage::Pending | Stage::Mined
        )
    }

    /// Record a submission the target accepted.
    pub fn mark_submitted(&mut self, remote_id: RemoteId) {
        self.remote_id = Some(remote_id);
        self.state = ObservedState::Accepted;
        self.confirmations = UNCONFIRMED;
        self.submitted_at = Some(Utc::now());
        if let Some(payload) = &self.payload {
            self.byte_size = payload.byte_size();
        }
    }

    /// Record an id recognised from an earlier run. The item is treated as
    /// confirmed with an unknown count so the next status pass resolves it.
    pub fn mark_deduplicated(&mut self, remote_id: RemoteId) {
        self.remote_id = Some(remote_id);
        self.state = ObservedState::Confirmed;
        self.confirmations = UNCONFIRMED;
        if let Some(payload) = &self.payload {
            self.byte_size = payload.byte_size();
        }
    }

    /// Mirror a status reported by the target.
    ///
    /// `NotFound` puts the item back in the queue; the stale remote id is
    /// kept only until the next submission replaces it.
    pub fn apply_status(&mut self, status: TargetStatus) {
        match status {
            TargetStatus::Confirmed { confirmations } => {
                self.state = ObservedState::Confirmed;
                self.confirmations = i64::try_from(confirmations).unwrap_or(i64::MAX);
            }
            TargetStatus::Accepted => {
                self.state = ObservedState::Accepted;
                self.confirmations = UNCONFIRMED;
            }
            TargetStatus::NotFound => {
                self.state = ObservedState::NotFound;
                self.confirmations = UNCONFIRMED;
                self.completed_at = None;
            }
        }
    }

    /// Drop the payload once the item no longer needs it.
    pub fn release_payload(&mut self) {
        self.payload = None;
    }

    /// Copy of this record without its payload.
    pub fn detached(&self) -> Self {
        Self {
            key: self.key.clone(),
            order_tier: self.order_tier,
            remote_id: self.remote_id.clone(),
            confirmations: self.confirmations,
            state: self.state,
            byte_size: self.byte_size,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            payload: None,
        }
    }

    /// Bring a deserialized record back to a consistent state.
    ///
    /// Only confirmed items carry a non-negative confirmation count.
    pub(crate) fn normalize(&mut self) {
        if self.state != ObservedState::Confirmed {
            self.confirmations = UNCONFIRMED;
        }
        if self.confirmations < UNCONFIRMED {
            self.confirmations = UNCONFIRMED;
        }
    }
}
