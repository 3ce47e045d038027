use futures_util::future::try_join_all;

use crate::environment::TargetEnvironment;
use crate::error::{Result, UploadError};
use crate::scheduler::record::{ObservedState, Stage};
use crate::scheduler::upload::Upload;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Items the target no longer knows about, now queued again.
    pub orphaned: usize,
    /// Items that reached the confirmation threshold in this pass.
    pub completed: usize,
}

/// Refresh the given records from the target's status.
///
/// Queries run in batches of `status_batch_size` with `status_batch_delay`
/// between batches. Results are applied per batch, so an error leaves every
/// earlier batch's updates in place.
pub async fn reconcile<T>(upload: &mut Upload, indices: &[usize], target: &T) -> Result<ReconcileReport>
where
    T: TargetEnvironment + ?Sized,
{
    let batch_size = upload.options.status_batch_size.max(1);
    let batch_delay = upload.options.status_batch_delay;
    let mut report = ReconcileReport::default();

    for (n, batch) in indices.chunks(batch_size).enumerate() {
        if n > 0 && !batch_delay.is_zero() {
            tokio::time::sleep(batch_delay).await;
        }

        let items = upload.items();
        let mut lookups = Vec::with_capacity(batch.len());
        for &idx in batch {
            let record = &items[idx];
            let remote_id = record
                .remote_id
                .as_deref()
                .ok_or_else(|| UploadError::MissingRemoteId(record.key.clone()))?;
            lookups.push(async move {
                match target.status(remote_id).await {
                    Ok(status) => Ok((idx, status)),
                    Err(source) => Err(UploadError::Status {
                        remote_id: remote_id.to_string(),
                        source,
                    }),
                }
            });
        }
        let statuses = try_join_all(lookups).await?;

        let required = upload.options.confirmations_required;
        let items = upload.items_mut();
        for (idx, status) in statuses {
            let record = &mut items[idx];
            let before = record.stage(required);
            let was_seen = record.state != ObservedState::NotFound;
            record.apply_status(status);
            let after = record.stage(required);
            report.checked += 1;

            if was_seen && after == Stage::Queued {
                report.orphaned += 1;
                tracing::warn!(
                    key = %record.key,
                    remote_id = ?record.remote_id,
                    "Item no longer known to target, requeued"
                );
            } else if before != Stage::Complete && after == Stage::Complete {
                report.completed += 1;
            }
            tracing::debug!(key = %record.key, %status, stage = %after, "Status updated");
        }
    }

    Ok(report)
}
