use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{OptionOverrides, UploadOptions};
use crate::error::Result;
use crate::scheduler::record::{ItemRecord, Stage};

/// Options plus every item record of an upload.
///
/// Records keep insertion order, which is the order the admission scan
/// walks the queue. Serializes without payloads so snapshots stay small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub options: UploadOptions,
    items: Vec<ItemRecord>,
}

impl Upload {
    pub fn new<I, K>(keys: I, options: UploadOptions) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        options.validate()?;
        Ok(Self {
            options,
            items: keys
                .into_iter()
                .map(|key| ItemRecord::new(key.into()))
                .collect(),
        })
    }

    /// Append items at an ordering tier. Lower tiers are admitted first.
    pub fn add_items<I, K>(&mut self, keys: I, order_tier: u32)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.items.extend(
            keys.into_iter()
                .map(|key| ItemRecord::with_tier(key.into(), order_tier)),
        );
    }

    pub fn items(&self) -> &[ItemRecord] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut [ItemRecord] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stage_of(&self, record: &ItemRecord) -> Stage {
        record.stage(self.options.confirmations_required)
    }

    /// Records in a stage, in insertion order.
    pub fn in_stage(&self, stage: Stage) -> Vec<&ItemRecord> {
        self.items
            .iter()
            .filter(|r| self.stage_of(r) == stage)
            .collect()
    }

    /// Indices of records in a stage, in insertion order.
    pub(crate) fn indices_in_stage(&self, stage: Stage) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, r)| self.stage_of(r) == stage)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn queued(&self) -> Vec<&ItemRecord> {
        self.in_stage(Stage::Queued)
    }

    pub fn pending(&self) -> Vec<&ItemRecord> {
        self.in_stage(Stage::Pending)
    }

    pub fn mined(&self) -> Vec<&ItemRecord> {
        self.in_stage(Stage::Mined)
    }

    pub fn complete(&self) -> Vec<&ItemRecord> {
        self.in_stage(Stage::Complete)
    }

    pub fn bytes_in_stage(&self, stage: Stage) -> u64 {
        self.items
            .iter()
            .filter(|r| self.stage_of(r) == stage)
            .map(|r| r.byte_size)
            .sum()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.bytes_in_stage(Stage::Queued)
    }

    pub fn pending_bytes(&self) -> u64 {
        self.bytes_in_stage(Stage::Pending)
    }

    pub fn mined_bytes(&self) -> u64 {
        self.bytes_in_stage(Stage::Mined)
    }

    pub fn complete_bytes(&self) -> u64 {
        self.bytes_in_stage(Stage::Complete)
    }

    /// Number of pending and mined records.
    pub fn in_flight_count(&self) -> usize {
        let required = self.options.confirmations_required;
        self.items.iter().filter(|r| r.is_in_flight(required)).count()
    }

    /// Summed size of pending and mined records.
    pub fn in_flight_bytes(&self) -> u64 {
        let required = self.options.confirmations_required;
        self.items
            .iter()
            .filter(|r| r.is_in_flight(required))
            .map(|r| r.byte_size)
            .sum()
    }

    /// True while any record is queued, pending or mined.
    pub fn has_work(&self) -> bool {
        self.items
            .iter()
            .any(|r| self.stage_of(r) != Stage::Complete)
    }

    /// Lowest tier among queued and pending records, if any.
    ///
    /// Mined records do not hold back later tiers.
    pub fn min_active_tier(&self) -> Option<u32> {
        self.items
            .iter()
            .filter(|r| matches!(self.stage_of(r), Stage::Queued | Stage::Pending))
            .map(|r| r.order_tier)
            .min()
    }

    /// Stamp newly complete records and drop their payloads.
    /// Returns how many records were released.
    pub fn release_completed(&mut self) -> usize {
        let required = self.options.confirmations_required;
        let mut released = 0;
        for record in self.items.iter_mut() {
            if record.stage(required) != Stage::Complete {
                continue;
            }
            if record.completed_at.is_none() {
                record.completed_at = Some(Utc::now());
            }
            if record.payload.is_some() {
                record.release_payload();
                released += 1;
            }
        }
        released
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore from a snapshot, applying overrides to the stored options.
    pub fn from_json(json: &str, overrides: &OptionOverrides) -> Result<Self> {
        let mut upload: Upload = serde_json::from_str(json)?;
        upload.options = upload.options.merged(overrides);
        upload.options.validate()?;
        for record in upload.items.iter_mut() {
            record.normalize();
        }
        Ok(upload)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.to_json()?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), items = self.items.len(), "Snapshot saved");
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>, overrides: &OptionOverrides) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        let upload = Self::from_json(&json, overrides)?;
        tracing::debug!(path = %path.display(), items = upload.items.len(), "Snapshot loaded");
        Ok(upload)
    }
}
