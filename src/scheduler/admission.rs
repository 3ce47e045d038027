use futures_util::future::join_all;

use crate::config::{UploadOptions, MIB};
use crate::environment::{SourceEnvironment, TargetEnvironment};
use crate::error::{Result, UploadError};
use crate::scheduler::record::Stage;
use crate::scheduler::upload::Upload;

/// Outcome of one admission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    pub submitted: usize,
    pub deduplicated: usize,
    pub skipped_oversize: usize,
    /// Count and bytes in flight once the submissions landed.
    pub in_flight_count: usize,
    pub in_flight_bytes: u64,
}

/// Running totals for the in-flight quotas during a single scan.
#[derive(Debug, Clone, Copy)]
struct Budget {
    count: usize,
    bytes: u64,
}

impl Budget {
    fn has_room(&self, opts: &UploadOptions) -> bool {
        self.count < opts.max_pending_txs && self.bytes < opts.max_pending_bytes
    }

    fn fits(&self, size: u64, opts: &UploadOptions) -> bool {
        self.bytes.saturating_add(size) <= opts.max_pending_bytes
    }

    fn take(&mut self, size: u64) {
        self.count += 1;
        self.bytes += size;
    }
}

/// Move queued items into flight while staying under the quotas.
///
/// Only items of the lowest tier still queued or pending are considered.
/// Each candidate's payload is fetched (or reused) and offered to the
/// source's dedup hook first; a known id short-circuits submission and does
/// not consume budget. Candidates too large for the remaining byte budget
/// stay queued and the scan moves on to smaller ones.
///
/// All selected items are submitted concurrently and every submission runs
/// to completion. Accepted ids are recorded even when a sibling submission
/// fails; the first submit error is then returned. Any fetch or dedup failure
/// aborts the pass before anything is submitted.
pub async fn admit<S, T>(upload: &mut Upload, source: &S, target: &T) -> Result<AdmissionReport>
where
    S: SourceEnvironment + ?Sized,
    T: TargetEnvironment + ?Sized,
{
    let opts = upload.options.clone();
    let mut budget = Budget {
        count: upload.in_flight_count(),
        bytes: upload.in_flight_bytes(),
    };
    let mut report = AdmissionReport::default();

    let queued = upload.indices_in_stage(Stage::Queued);
    tracing::debug!(
        queued = queued.len(),
        in_flight = budget.count,
        in_flight_mib = budget.bytes as f64 / MIB as f64,
        "Admission pass starting"
    );

    let Some(min_tier) = upload.min_active_tier() else {
        return Ok(finish(report, budget));
    };

    let mut selected = Vec::new();
    for idx in queued {
        if !budget.has_room(&opts) {
            break;
        }

        let record = &mut upload.items_mut()[idx];
        if record.order_tier != min_tier {
            continue;
        }

        let payload = match record.payload.take() {
            Some(payload) => payload,
            None => source
                .fetch(&record.key)
                .await
                .map_err(|source| UploadError::Fetch {
                    key: record.key.clone(),
                    source,
                })?,
        };
        let size = payload.byte_size();
        if size > opts.max_item_size {
            return Err(UploadError::ItemTooLarge {
                key: record.key.clone(),
                size,
                max: opts.max_item_size,
            });
        }
        record.byte_size = size;

        if let Some(dedup) = source.deduplicator() {
            let existing = dedup
                .existing_id(&record.key, &payload)
                .await
                .map_err(|source| UploadError::Dedup {
                    key: record.key.clone(),
                    source,
                })?;
            if let Some(remote_id) = existing {
                tracing::debug!(key = %record.key, remote_id = %remote_id, "Found earlier submission");
                record.payload = Some(payload);
                record.mark_deduplicated(remote_id);
                report.deduplicated += 1;
                continue;
            }
        }

        record.payload = Some(payload);

        if !budget.fits(size, &opts) {
            report.skipped_oversize += 1;
            continue;
        }

        budget.take(size);
        selected.push(idx);
    }

    // A failed submission ends the whole upload; collaborators retry
    // transient errors before surfacing them.
    let items = upload.items();
    let submissions = selected.iter().filter_map(|&idx| {
        let record = &items[idx];
        let payload = record.payload.as_ref()?;
        Some(async move {
            match target.submit(payload).await {
                Ok(remote_id) => Ok((idx, remote_id)),
                Err(source) => Err(UploadError::Submit {
                    key: record.key.clone(),
                    source,
                }),
            }
        })
    });
    let outcomes = join_all(submissions).await;

    let items = upload.items_mut();
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok((idx, remote_id)) => {
                let record = &mut items[idx];
                tracing::debug!(key = %record.key, remote_id = %remote_id, bytes = record.byte_size, "Item submitted");
                record.mark_submitted(remote_id);
                report.submitted += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Submission failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    tracing::info!(
        submitted = report.submitted,
        deduplicated = report.deduplicated,
        skipped = report.skipped_oversize,
        tier = min_tier,
        in_flight = budget.count,
        in_flight_mib = %format!("{:.2}", budget.bytes as f64 / MIB as f64),
        "Admission pass complete"
    );

    Ok(finish(report, budget))
}

fn finish(mut report: AdmissionReport, budget: Budget) -> AdmissionReport {
    report.in_flight_count = budget.count;
    report.in_flight_bytes = budget.bytes;
    report
}
