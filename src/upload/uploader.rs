use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use crate::config::UploaderConfig;
use super::abort::AbortRegistry;
use super::canalize::{canalize, progress_of};
use super::errors::{Result, UploadError};
use super::operators::{enqueue, ThumbLedger};
use super::pipeline::{Pipeline, StageContext};
use super::types::{Progress, QueueUpload, Upload, UploadId, UploadState};

/// Entry point of the upload pipeline.
///
/// Runs `enqueue`, then the supplied stages, then the reconciliation, and
/// exposes the reconciled snapshot. Must be created inside a tokio runtime.
/// Dropping the uploader aborts everything still in flight.
pub struct Uploader {
    queue_tx: mpsc::UnboundedSender<QueueUpload>,
    flush_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    aborts: AbortRegistry,
    thumbs: ThumbLedger,
    snapshot: watch::Receiver<Vec<Upload>>,
    canalize_handle: JoinHandle<()>,
    config: UploaderConfig,
}

impl Uploader {
    pub fn new(pipeline: Pipeline, config: UploaderConfig) -> Self {
        let aborts = AbortRegistry::new();
        let thumbs = ThumbLedger::new();
        let ctx = StageContext::new(aborts.clone(), thumbs.clone(), config.clone());

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let items = enqueue(queue_rx, aborts.clone());
        let items = pipeline.run(items, &ctx);
        let (snapshot, canalize_handle) = canalize(items, flush_rx, aborts.clone());

        Self {
            queue_tx,
            flush_tx,
            aborts,
            thumbs,
            snapshot,
            canalize_handle,
            config,
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Queues `items` and returns a view of just these ids
    pub fn upload(&self, items: impl IntoIterator<Item = QueueUpload>) -> Result<UploadView> {
        let mut ids = HashSet::new();

        for item in items {
            // tracked before it is queued, so an immediate abort is not lost
            self.aborts.register(&item.id);
            ids.insert(item.id.clone());
            self.queue_tx.send(item).map_err(|_| UploadError::Shutdown)?;
        }

        Ok(UploadView {
            ids,
            snapshot: self.snapshot.clone(),
        })
    }

    /// Returns whether `id` was active
    pub fn abort(&self, id: &UploadId) -> bool {
        let aborted = self.aborts.abort(id);
        tracing::debug!(target: "uploader", %id, aborted, "abort requested");
        aborted
    }

    pub fn abort_all(&self) -> Vec<UploadId> {
        let aborted = self.aborts.abort_all();
        tracing::debug!(target: "uploader", count = aborted.len(), "abort all requested");
        aborted
    }

    /// Aborts everything active, revokes issued thumbnails and starts a new
    /// epoch with an empty snapshot. Returns once the empty snapshot is out.
    pub async fn flush(&self) -> Result<()> {
        let aborted = self.aborts.abort_all();
        let revoked = self.thumbs.revoke_all();
        self.aborts.reset();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.flush_tx.send(reply_tx).map_err(|_| UploadError::Shutdown)?;
        reply_rx.await.map_err(|_| UploadError::Shutdown)?;

        tracing::debug!(target: "uploader", aborted = aborted.len(), revoked, "flushed");
        Ok(())
    }

    /// Current snapshot, one record per id in first-seen order
    pub fn uploads(&self) -> Vec<Upload> {
        self.snapshot.borrow().clone()
    }

    /// Hot snapshot stream, a new receiver sees the latest snapshot first
    pub fn subscribe(&self) -> watch::Receiver<Vec<Upload>> {
        self.snapshot.clone()
    }

    /// Items that have not reached `Uploaded` yet
    pub fn active(&self) -> Vec<Upload> {
        self.snapshot
            .borrow()
            .iter()
            .filter(|upload| upload.state < UploadState::Uploaded)
            .cloned()
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.snapshot.borrow().iter().any(|upload| upload.state < UploadState::Uploaded)
    }

    pub fn progress(&self) -> Progress {
        progress_of(&self.snapshot.borrow())
    }

    /// Batches of items that turned `Uploaded`, each emitted once the
    /// snapshot was quiet for `newly_debounce`. Empty batches are skipped.
    pub fn newly_uploaded(&self) -> mpsc::UnboundedReceiver<Vec<Upload>> {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let mut snapshot = self.snapshot.clone();
        let debounce = self.config.newly_debounce;

        tokio::spawn(async move {
            let mut previous: HashSet<UploadId> = HashSet::new();
            let mut pending: Vec<Upload> = Vec::new();
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = batch_tx.closed() => break,
                    changed = snapshot.changed() => {
                        if changed.is_err() {
                            break;
                        }

                        let uploaded: Vec<Upload> = snapshot
                            .borrow_and_update()
                            .iter()
                            .filter(|upload| upload.state == UploadState::Uploaded)
                            .cloned()
                            .collect();

                        for upload in &uploaded {
                            if !previous.contains(&upload.id) {
                                pending.retain(|seen| seen.id != upload.id);
                                pending.push(upload.clone());
                            }
                        }

                        previous = uploaded.into_iter().map(|upload| upload.id).collect();
                        deadline = Some(Instant::now() + debounce);
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        if !pending.is_empty() && batch_tx.send(std::mem::take(&mut pending)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        batch_rx
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.aborts.shutdown();
        self.canalize_handle.abort();
    }
}

/// Snapshot filtered down to the ids of one [`Uploader::upload`] call
#[derive(Debug, Clone)]
pub struct UploadView {
    ids: HashSet<UploadId>,
    snapshot: watch::Receiver<Vec<Upload>>,
}

fn pick(ids: &HashSet<UploadId>, uploads: &[Upload]) -> Vec<Upload> {
    uploads.iter().filter(|upload| ids.contains(&upload.id)).cloned().collect()
}

impl UploadView {
    pub fn ids(&self) -> &HashSet<UploadId> {
        &self.ids
    }

    pub fn current(&self) -> Vec<Upload> {
        pick(&self.ids, &self.snapshot.borrow())
    }

    /// Waits for the next snapshot change
    pub async fn changed(&mut self) -> Result<Vec<Upload>> {
        self.snapshot.changed().await.map_err(|_| UploadError::Shutdown)?;
        Ok(pick(&self.ids, &self.snapshot.borrow_and_update()))
    }

    /// Waits until `predicate` holds for the records of this view
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Vec<Upload>>
    where
        F: FnMut(&[Upload]) -> bool,
    {
        loop {
            let uploads = pick(&self.ids, &self.snapshot.borrow_and_update());
            if predicate(&uploads) {
                return Ok(uploads);
            }
            self.snapshot.changed().await.map_err(|_| UploadError::Shutdown)?;
        }
    }

    /// Waits until every id of this view has a terminal record.
    ///
    /// Post-processing reopens `Uploaded` records, so an uploaded item may
    /// still change afterwards.
    pub async fn settled(&mut self) -> Result<Vec<Upload>> {
        let expected = self.ids.len();
        self.wait_for(|uploads| uploads.len() == expected && uploads.iter().all(|upload| upload.state.is_terminal()))
            .await
    }
}
