//! End-to-end tests driving the uploader against the simulated chain.
//!
//! The target is advanced deterministically: one block is mined right after
//! every admission step, so each in-flight item gains exactly one
//! confirmation per cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;

use post_many::config::{OptionOverrides, UploadOptions, MIB};
use post_many::environment::{BoxError, Payload, RemoteId, TargetEnvironment, TargetStatus};
use post_many::scheduler::{Phase, Progress, Stage, Upload, Uploader};
use post_many::sim::{SimSource, SimTarget, SizeProfile};
use post_many::UploadError;

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("random_file_name_{}.foo", i)).collect()
}

fn fast(options: UploadOptions) -> UploadOptions {
    options
        .with_poll_interval(Duration::from_millis(1))
        .with_status_batching(5, Duration::ZERO)
}

/// Step until finished, mining one block after each admission and handing
/// every progress to `check`.
async fn drive<F>(
    uploader: &mut Uploader<Arc<SimSource>, Arc<SimTarget>>,
    target: &SimTarget,
    mut check: F,
) -> Vec<Progress>
where
    F: FnMut(&Progress),
{
    let mut seen = Vec::new();
    while let Some(progress) = uploader.step().await.unwrap() {
        check(&progress);
        if progress.phase == Phase::Admitted {
            target.mine_block(usize::MAX).await;
        }
        seen.push(progress);
        assert!(seen.len() < 1_000, "upload did not terminate");
    }
    seen
}

fn terminal_state(upload: &Upload) -> BTreeMap<String, (Stage, i64)> {
    upload
        .items()
        .iter()
        .map(|r| (r.key.clone(), (upload.stage_of(r), r.confirmations)))
        .collect()
}

#[tokio::test]
async fn completes_thirty_items_within_quotas() {
    let options = fast(
        UploadOptions::default()
            .with_max_pending_bytes(40 * MIB)
            .with_max_pending_txs(10)
            .with_confirmations_required(4),
    );
    let source = Arc::new(SimSource::new(SizeProfile::Cycle(vec![
        2 * MIB,
        4 * MIB,
        6 * MIB,
        8 * MIB,
    ])));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(30), options.clone()).unwrap();
    let mut uploader = Uploader::new(upload, source, target.clone());

    let seen = drive(&mut uploader, &target, |p| {
        assert!(p.in_flight_count() <= options.max_pending_txs);
        assert!(p.in_flight_bytes <= options.max_pending_bytes);
        let in_flight: u64 = p
            .pending
            .iter()
            .chain(p.mined.iter())
            .map(|r| r.byte_size)
            .sum();
        assert_eq!(in_flight, p.in_flight_bytes);
        assert_eq!(p.total(), 30);
    })
    .await;

    let last = seen.last().unwrap();
    assert_eq!(last.phase, Phase::Reconciled);
    assert!(last.queued.is_empty());
    assert!(last.pending.is_empty());
    assert!(last.mined.is_empty());
    assert_eq!(last.complete.len(), 30);
    assert!(last.complete.iter().all(|r| r.confirmations == 4));
    assert!(uploader.upload().items().iter().all(|r| r.payload.is_none()));
    assert_eq!(target.posted(), 30);
}

#[tokio::test]
async fn resumed_upload_checks_in_flight_items_first() {
    let options = fast(
        UploadOptions::default()
            .with_max_pending_bytes(400 * MIB)
            .with_max_pending_txs(100),
    );
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(MIB)));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(30), options).unwrap();
    let mut uploader = Uploader::new(upload, source.clone(), target.clone());

    let first = uploader.step().await.unwrap().unwrap();
    assert_eq!(first.phase, Phase::Admitted);
    assert_eq!(first.pending.len(), 30);

    let snapshot = uploader.upload().to_json().unwrap();
    drop(uploader);

    // the chain moves on while the upload is suspended
    target.mine_block(10).await;

    let restored = Upload::from_json(&snapshot, &OptionOverrides::default()).unwrap();
    let mut uploader = Uploader::new(restored, source, target.clone());
    let resumed = uploader.step().await.unwrap().unwrap();

    assert_eq!(resumed.phase, Phase::Resumed);
    assert_eq!(resumed.mined.len(), 10);
    assert_eq!(resumed.pending.len(), 20);
    assert!(resumed.queued.is_empty());
    assert_eq!(target.posted(), 30);
}

#[tokio::test]
async fn resume_reaches_same_terminal_state_as_uninterrupted_run() {
    let options = fast(
        UploadOptions::default()
            .with_max_pending_bytes(12 * MIB)
            .with_max_pending_txs(4)
            .with_confirmations_required(3),
    );
    let profile = SizeProfile::Cycle(vec![MIB, 3 * MIB, 5 * MIB]);

    let straight = {
        let source = Arc::new(SimSource::new(profile.clone()));
        let target = Arc::new(SimTarget::new());
        let upload = Upload::new(keys(12), options.clone()).unwrap();
        let mut uploader = Uploader::new(upload, source, target.clone());
        drive(&mut uploader, &target, |_| {}).await;
        terminal_state(uploader.upload())
    };

    let resumed = {
        let source = Arc::new(SimSource::new(profile));
        let target = Arc::new(SimTarget::new());
        let upload = Upload::new(keys(12), options).unwrap();
        let mut uploader = Uploader::new(upload, source.clone(), target.clone());

        // run a few steps, then suspend via a snapshot
        for _ in 0..5 {
            let progress = uploader.step().await.unwrap().unwrap();
            if progress.phase == Phase::Admitted {
                target.mine_block(usize::MAX).await;
            }
        }
        let snapshot = uploader.upload().to_json().unwrap();

        let restored = Upload::from_json(&snapshot, &OptionOverrides::default()).unwrap();
        let mut uploader = Uploader::new(restored, source, target.clone());
        drive(&mut uploader, &target, |_| {}).await;
        terminal_state(uploader.upload())
    };

    assert_eq!(straight, resumed);
    assert!(straight
        .values()
        .all(|(stage, confirmations)| *stage == Stage::Complete && *confirmations == 3));
}

#[tokio::test]
async fn lower_tiers_clear_before_higher_tiers_are_submitted() {
    let options = fast(UploadOptions::default().with_max_pending_txs(100));
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(1024)));
    let target = Arc::new(SimTarget::new());

    let mut upload = Upload::new(Vec::<String>::new(), options).unwrap();
    for tier in 0..3u32 {
        upload.add_items((0..5).map(|i| format!("tier{}_{}", tier, i)), tier);
    }
    let mut uploader = Uploader::new(upload, source, target.clone());

    drive(&mut uploader, &target, |p| {
        let active_tier = p
            .queued
            .iter()
            .chain(p.pending.iter())
            .map(|r| r.order_tier)
            .min();
        if let Some(tier) = active_tier {
            // nothing above the lowest active tier may have been submitted
            let leaked = p
                .pending
                .iter()
                .chain(p.mined.iter())
                .chain(p.complete.iter())
                .any(|r| r.order_tier > tier);
            assert!(!leaked, "tier above {} submitted early", tier);
        }
    })
    .await;

    let order = target.known_keys().await;
    assert_eq!(order.len(), 15);
    for (i, key) in order.iter().enumerate() {
        assert!(key.starts_with(&format!("tier{}_", i / 5)), "{} out of order", key);
    }
    assert_eq!(uploader.upload().complete().len(), 15);
}

#[tokio::test]
async fn orphaned_items_are_resubmitted() {
    let options = fast(UploadOptions::default().with_confirmations_required(2));
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(1024)));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(3), options).unwrap();
    let mut uploader = Uploader::new(upload, source.clone(), target.clone());

    let admitted = uploader.step().await.unwrap().unwrap();
    assert_eq!(admitted.pending.len(), 3);
    target.mine_block(usize::MAX).await;

    let reconciled = uploader.step().await.unwrap().unwrap();
    assert_eq!(reconciled.mined.len(), 3);
    let first_ids: Vec<Option<RemoteId>> =
        reconciled.mined.iter().map(|r| r.remote_id.clone()).collect();

    // reorg drops the block holding every item
    assert_eq!(target.orphan_blocks(1).await, 3);

    // next admission has nothing to do, the following reconcile requeues
    let admitted = uploader.step().await.unwrap().unwrap();
    assert_eq!(admitted.phase, Phase::Admitted);
    let requeued = uploader.step().await.unwrap().unwrap();
    assert_eq!(requeued.queued.len(), 3);

    let resubmitted = uploader.step().await.unwrap().unwrap();
    assert_eq!(resubmitted.pending.len(), 3);
    assert_eq!(target.posted(), 6);
    for (record, old) in resubmitted.pending.iter().zip(first_ids) {
        assert_ne!(record.remote_id, old);
    }
    // payloads were kept, so nothing was fetched twice
    assert_eq!(source.fetched(), 3);

    target.mine_block(usize::MAX).await;
    drive(&mut uploader, &target, |_| {}).await;
    assert_eq!(uploader.upload().complete().len(), 3);
}

#[tokio::test]
async fn deduplicated_items_are_not_resubmitted() {
    let options = fast(UploadOptions::default().with_confirmations_required(2));
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(1024)).with_dedup());
    source.remember("random_file_name_1.foo", "tx_previous_run").await;
    let target = Arc::new(SimTarget::new());
    target.preload("tx_previous_run").await;

    let upload = Upload::new(keys(4), options).unwrap();
    let mut uploader = Uploader::new(upload, source, target.clone());

    let admitted = uploader.step().await.unwrap().unwrap();
    assert_eq!(admitted.pending.len(), 3);
    assert_eq!(admitted.mined.len(), 1);
    assert_eq!(admitted.mined[0].remote_id.as_deref(), Some("tx_previous_run"));
    target.mine_block(usize::MAX).await;

    drive(&mut uploader, &target, |_| {}).await;

    assert_eq!(target.posted(), 3);
    assert_eq!(uploader.upload().complete().len(), 4);
}

#[tokio::test]
async fn already_complete_upload_emits_once_and_stops() {
    let options = fast(UploadOptions::default().with_confirmations_required(1));
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(16)));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(2), options).unwrap();
    let mut uploader = Uploader::new(upload, source.clone(), target.clone());
    drive(&mut uploader, &target, |_| {}).await;

    let snapshot = uploader.upload().to_json().unwrap();
    let restored = Upload::from_json(&snapshot, &OptionOverrides::default()).unwrap();
    let mut uploader = Uploader::new(restored, source, target.clone());

    let only = uploader.step().await.unwrap().unwrap();
    assert_eq!(only.phase, Phase::Done);
    assert_eq!(only.complete.len(), 2);
    assert!(uploader.step().await.unwrap().is_none());
    assert_eq!(target.posted(), 2);
}

/// Reports a raw status code the way an SDK adapter would.
struct CodeTarget {
    inner: SimTarget,
    code: u16,
}

#[async_trait]
impl TargetEnvironment for CodeTarget {
    async fn submit(&self, payload: &Payload) -> Result<RemoteId, BoxError> {
        self.inner.submit(payload).await
    }

    async fn status(&self, _remote_id: &str) -> Result<TargetStatus, BoxError> {
        Ok(TargetStatus::from_code(self.code, None)?)
    }
}

#[tokio::test]
async fn unknown_status_code_aborts_the_upload() {
    let options = fast(UploadOptions::default());
    let source = SimSource::new(SizeProfile::Fixed(16));
    let target = CodeTarget {
        inner: SimTarget::new(),
        code: 500,
    };
    let upload = Upload::new(keys(2), options).unwrap();
    let mut uploader = Uploader::new(upload, source, target);

    assert_eq!(uploader.step().await.unwrap().unwrap().phase, Phase::Admitted);

    let err = uploader.step().await.unwrap_err();
    let source = match err {
        UploadError::Status { source, .. } => source,
        other => panic!("expected status error, got {:?}", other),
    };
    assert!(matches!(
        source.downcast_ref::<UploadError>(),
        Some(UploadError::UnknownStatus { code: 500 })
    ));
    // state is left as of the last snapshot
    assert_eq!(uploader.upload().pending().len(), 2);
}

#[tokio::test]
async fn spawned_upload_streams_progress_until_done() {
    let options = fast(UploadOptions::default().with_confirmations_required(0));
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(64)));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(5), options).unwrap();

    // mine continuously in the background instead of per step
    let token = tokio_util::sync::CancellationToken::new();
    let miner = tokio::spawn(target.clone().run_miner(
        post_many::sim::MinerConfig {
            block_time: Duration::from_millis(2),
            orphan_chance: 0.0,
            ..Default::default()
        },
        token.clone(),
    ));

    let mut handle = Uploader::new(upload, source, target.clone()).spawn(1);
    let mut last = None;
    while let Some(progress) = handle.progress.next().await {
        last = Some(progress.unwrap());
    }
    let uploader = handle.task.await.unwrap();
    token.cancel();
    miner.await.unwrap();

    let last = last.unwrap();
    assert!(last.is_done());
    assert_eq!(last.complete.len(), 5);
    assert!(uploader.is_finished());
    assert_eq!(uploader.upload().complete().len(), 5);
}

#[tokio::test]
async fn snapshot_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.json");

    let options = fast(UploadOptions::default());
    let source = Arc::new(SimSource::new(SizeProfile::Fixed(2048)));
    let target = Arc::new(SimTarget::new());
    let upload = Upload::new(keys(3), options).unwrap();
    let mut uploader = Uploader::new(upload, source, target);
    uploader.step().await.unwrap();
    uploader.upload().save(&path).await.unwrap();

    let overrides = OptionOverrides {
        max_pending_txs: Some(1),
        ..Default::default()
    };
    let loaded = Upload::load(&path, &overrides).await.unwrap();
    assert_eq!(loaded.options.max_pending_txs, 1);
    assert_eq!(loaded.pending().len(), 3);
    assert_eq!(loaded.pending_bytes(), 3 * 2048);
    assert!(loaded.items().iter().all(|r| r.payload.is_none()));

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains("payload"));
}

#[tokio::test]
async fn misconfigured_quotas_are_rejected() {
    let options = UploadOptions::default()
        .with_max_item_size(10 * MIB)
        .with_max_pending_bytes(MIB);
    let result = Upload::new(keys(1), options);
    assert!(matches!(result, Err(UploadError::Config(_))));
}
