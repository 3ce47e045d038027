use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};

pub const MIB: u64 = 1024 * 1024;

/// Quotas and polling behaviour for an upload.
///
/// Persisted alongside the item records in every snapshot, so a restored
/// upload resumes with the same limits unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Upper bound on the summed size of pending and mined items.
    pub max_pending_bytes: u64,
    /// Upper bound on the number of pending and mined items.
    pub max_pending_txs: usize,
    /// Largest payload a single item may have.
    pub max_item_size: u64,
    /// Confirmations after which an item is complete.
    pub confirmations_required: u32,
    /// Delay between admitting new items and checking their status.
    #[serde(rename = "poll_interval_seconds", with = "duration_secs")]
    pub poll_interval: Duration,
    /// Number of status queries issued concurrently per batch.
    #[serde(default = "default_status_batch_size")]
    pub status_batch_size: usize,
    /// Pause between status query batches.
    #[serde(
        rename = "status_batch_delay_ms",
        with = "duration_ms",
        default = "default_status_batch_delay"
    )]
    pub status_batch_delay: Duration,
}

fn default_status_batch_size() -> usize {
    5
}

fn default_status_batch_delay() -> Duration {
    Duration::from_millis(30)
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            max_pending_bytes: 30 * MIB,
            max_pending_txs: 40,
            max_item_size: 10 * MIB,
            confirmations_required: 4,
            poll_interval: Duration::from_secs(20),
            status_batch_size: default_status_batch_size(),
            status_batch_delay: default_status_batch_delay(),
        }
    }
}

impl UploadOptions {
    pub fn with_max_pending_bytes(mut self, bytes: u64) -> Self {
        self.max_pending_bytes = bytes;
        self
    }

    pub fn with_max_pending_txs(mut self, txs: usize) -> Self {
        self.max_pending_txs = txs;
        self
    }

    pub fn with_max_item_size(mut self, bytes: u64) -> Self {
        self.max_item_size = bytes;
        self
    }

    pub fn with_confirmations_required(mut self, confirmations: u32) -> Self {
        self.confirmations_required = confirmations;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_status_batching(mut self, size: usize, delay: Duration) -> Self {
        self.status_batch_size = size;
        self.status_batch_delay = delay;
        self
    }

    /// Reject quota combinations under which the scheduler cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_bytes < self.max_item_size {
            return Err(UploadError::Config(format!(
                "max_pending_bytes must be at least max_item_size: {}",
                self.max_item_size
            )));
        }
        if self.max_pending_txs == 0 {
            return Err(UploadError::Config(
                "max_pending_txs must be greater than zero".to_string(),
            ));
        }
        if self.status_batch_size == 0 {
            return Err(UploadError::Config(
                "status_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply overrides on top of these options.
    pub fn merged(mut self, overrides: &OptionOverrides) -> Self {
        if let Some(v) = overrides.max_pending_bytes {
            self.max_pending_bytes = v;
        }
        if let Some(v) = overrides.max_pending_txs {
            self.max_pending_txs = v;
        }
        if let Some(v) = overrides.max_item_size {
            self.max_item_size = v;
        }
        if let Some(v) = overrides.confirmations_required {
            self.confirmations_required = v;
        }
        if let Some(v) = overrides.poll_interval {
            self.poll_interval = v;
        }
        if let Some(v) = overrides.status_batch_size {
            self.status_batch_size = v;
        }
        if let Some(v) = overrides.status_batch_delay {
            self.status_batch_delay = v;
        }
        self
    }
}

/// Optional replacements for persisted options, applied when restoring.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionOverrides {
    pub max_pending_bytes: Option<u64>,
    pub max_pending_txs: Option<usize>,
    pub max_item_size: Option<u64>,
    pub confirmations_required: Option<u32>,
    pub poll_interval: Option<Duration>,
    pub status_batch_size: Option<usize>,
    pub status_batch_delay: Option<Duration>,
}

impl OptionOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
