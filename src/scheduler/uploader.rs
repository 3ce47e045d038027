use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::MIB;
use crate::environment::{SourceEnvironment, TargetEnvironment};
use crate::error::Result;
use crate::scheduler::admission::admit;
use crate::scheduler::reconcile::reconcile;
use crate::scheduler::record::{ItemRecord, Stage};
use crate::scheduler::upload::Upload;

/// Which step produced a progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// In-flight items of a restored upload were re-checked.
    Resumed,
    /// New items were moved into flight.
    Admitted,
    /// In-flight items were refreshed from the target.
    Reconciled,
    /// There was nothing to do.
    Done,
}

/// Observable state after a step. Records are copied without payloads.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub phase: Phase,
    pub queued: Vec<ItemRecord>,
    pub pending: Vec<ItemRecord>,
    pub mined: Vec<ItemRecord>,
    pub complete: Vec<ItemRecord>,
    pub pending_bytes: u64,
    pub in_flight_bytes: u64,
}

impl Progress {
    pub fn capture(upload: &Upload, phase: Phase) -> Self {
        Self {
            phase,
            queued: detached(upload, Stage::Queued),
            pending: detached(upload, Stage::Pending),
            mined: detached(upload, Stage::Mined),
            complete: detached(upload, Stage::Complete),
            pending_bytes: upload.pending_bytes(),
            in_flight_bytes: upload.in_flight_bytes(),
        }
    }

    pub fn total(&self) -> usize {
        self.queued.len() + self.pending.len() + self.mined.len() + self.complete.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len() + self.mined.len()
    }

    /// Every item is complete.
    pub fn is_done(&self) -> bool {
        self.queued.is_empty() && self.pending.is_empty() && self.mined.is_empty()
    }
}

fn detached(upload: &Upload, stage: Stage) -> Vec<ItemRecord> {
    upload
        .in_stage(stage)
        .into_iter()
        .map(ItemRecord::detached)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ResumeCheck,
    Admit,
    Reconcile,
    Finished,
}

/// Drives an [`Upload`] to completion one step at a time.
///
/// Each call to [`Uploader::step`] runs exactly one of: resume check,
/// admission, or wait-then-reconcile, and returns the resulting
/// [`Progress`]. Between calls the upload is consistent and can be
/// snapshotted; a caller that stops calling `step` has nothing to clean up.
/// A failed step leaves the machine on that step so it can be retried.
pub struct Uploader<S, T> {
    upload: Upload,
    source: S,
    target: T,
    step: Step,
}

impl<S, T> Uploader<S, T>
where
    S: SourceEnvironment,
    T: TargetEnvironment,
{
    pub fn new(upload: Upload, source: S, target: T) -> Self {
        Self {
            upload,
            source,
            target,
            step: Step::Init,
        }
    }

    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    pub fn into_upload(self) -> Upload {
        self.upload
    }

    pub fn is_finished(&self) -> bool {
        self.step == Step::Finished
    }

    /// Run the next step. Returns `None` once the upload has finished.
    pub async fn step(&mut self) -> Result<Option<Progress>> {
        loop {
            match self.step {
                Step::Init => {
                    self.upload.options.validate()?;
                    if !self.upload.has_work() {
                        tracing::info!(items = self.upload.len(), "Nothing to upload");
                        self.step = Step::Finished;
                        return Ok(Some(Progress::capture(&self.upload, Phase::Done)));
                    }
                    self.step = if self.upload.in_flight_count() > 0 {
                        Step::ResumeCheck
                    } else {
                        Step::Admit
                    };
                }
                Step::ResumeCheck => {
                    tracing::info!(
                        in_flight = self.upload.in_flight_count(),
                        "Checking in-flight items of resumed upload"
                    );
                    self.reconcile_in_flight().await?;
                    self.step = if self.upload.has_work() {
                        Step::Admit
                    } else {
                        Step::Finished
                    };
                    return Ok(Some(Progress::capture(&self.upload, Phase::Resumed)));
                }
                Step::Admit => {
                    admit(&mut self.upload, &self.source, &self.target).await?;
                    self.step = Step::Reconcile;
                    return Ok(Some(Progress::capture(&self.upload, Phase::Admitted)));
                }
                Step::Reconcile => {
                    if self.upload.has_work() {
                        let poll = self.upload.options.poll_interval;
                        tracing::debug!(seconds = poll.as_secs_f64(), "Waiting before status check");
                        tokio::time::sleep(poll).await;
                    }
                    self.reconcile_in_flight().await?;
                    self.step = if self.upload.has_work() {
                        Step::Admit
                    } else {
                        Step::Finished
                    };
                    return Ok(Some(Progress::capture(&self.upload, Phase::Reconciled)));
                }
                Step::Finished => return Ok(None),
            }
        }
    }

    /// Step until finished, returning the last progress.
    pub async fn run(&mut self) -> Result<Progress> {
        let mut last = None;
        while let Some(progress) = self.step().await? {
            last = Some(progress);
        }
        Ok(last.unwrap_or_else(|| Progress::capture(&self.upload, Phase::Done)))
    }

    /// Pending items first, then mined ones; both lists are taken up front
    /// so each record is queried at most once.
    async fn reconcile_in_flight(&mut self) -> Result<()> {
        let pending = self.upload.indices_in_stage(Stage::Pending);
        let mined = self.upload.indices_in_stage(Stage::Mined);

        let from_pending = reconcile(&mut self.upload, &pending, &self.target).await?;
        let from_mined = reconcile(&mut self.upload, &mined, &self.target).await?;
        self.upload.release_completed();

        tracing::info!(
            queued = self.upload.queued().len(),
            pending = self.upload.pending().len(),
            pending_mib = %format!("{:.2}", self.upload.pending_bytes() as f64 / MIB as f64),
            mined = self.upload.mined().len(),
            complete = self.upload.complete().len(),
            orphaned = from_pending.orphaned + from_mined.orphaned,
            "Upload status"
        );
        Ok(())
    }
}

/// A running upload task and the stream of its progress.
pub struct UploadHandle<S, T> {
    pub progress: ReceiverStream<Result<Progress>>,
    pub task: JoinHandle<Uploader<S, T>>,
}

impl<S, T> Uploader<S, T>
where
    S: SourceEnvironment + 'static,
    T: TargetEnvironment + 'static,
{
    /// Run the upload on its own task, pushing each progress onto a bounded
    /// channel. The task stops after the first error, when finished, or when
    /// the stream is dropped, and hands the uploader back for snapshotting.
    pub fn spawn(mut self, buffer: usize) -> UploadHandle<S, T> {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let task = tokio::spawn(async move {
            loop {
                match self.step().await {
                    Ok(Some(progress)) => {
                        if tx.send(Ok(progress)).await.is_err() {
                            tracing::debug!("Progress receiver dropped, stopping upload");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Upload aborted");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            self
        });

        UploadHandle {
            progress: ReceiverStream::new(rx),
            task,
        }
    }
}
