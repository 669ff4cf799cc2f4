use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use super::abort::AbortRegistry;
use super::helpers::ItemReceiver;
use super::types::{Item, Progress, Thumb, Upload, UploadId, UploadState};

/// One record per id, in first-seen order
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    order: Vec<UploadId>,
    records: HashMap<UploadId, Upload>,
    // thumbs that overtook the first record of their id
    early_thumbs: HashMap<UploadId, Thumb>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one update into the snapshot and returns the merged record.
    ///
    /// Failed and Aborted stick, errors only grow, a thumb-only update keeps
    /// everything else. A thumb for an id without a record is held back until
    /// the record arrives, `None` is returned meanwhile.
    pub fn apply(&mut self, item: Item) -> Option<&Upload> {
        let incoming = match item {
            Item::File(item) => item.upload,
            Item::Upload(upload) => upload,
            Item::Thumb { id, thumb } => {
                let Some(record) = self.records.get_mut(&id) else {
                    self.early_thumbs.insert(id, thumb);
                    return None;
                };
                record.thumb = Some(thumb);
                return Some(&*record);
            }
        };

        let id = incoming.id.clone();
        let merged = match self.records.remove(&id) {
            Some(previous) => merge(previous, incoming),
            None => {
                self.order.push(id.clone());
                let mut incoming = incoming;
                if let Some(thumb) = self.early_thumbs.remove(&id) {
                    incoming.thumb = incoming.thumb.or(Some(thumb));
                }
                incoming
            }
        };

        self.records.insert(id.clone(), merged);
        self.records.get(&id)
    }

    pub fn get(&self, id: &UploadId) -> Option<&Upload> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.records.clear();
        self.early_thumbs.clear();
    }

    pub fn to_vec(&self) -> Vec<Upload> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .cloned()
            .collect()
    }
}

fn merge(previous: Upload, incoming: Upload) -> Upload {
    let state = if previous.state.is_sticky() { previous.state } else { incoming.state };

    let mut errors = previous.errors;
    for error in incoming.errors {
        if !errors.contains(&error) {
            errors.push(error);
        }
    }

    Upload {
        state,
        errors,
        thumb: incoming.thumb.or(previous.thumb),
        ..incoming
    }
}

/// Folds the final item stream into a snapshot published on a watch channel.
///
/// Updates for ids `aborts` no longer tracks are dropped, so stragglers of a
/// flushed epoch never reappear. An id is settled once its record turns
/// terminal. A flush request empties the snapshot and is acknowledged after
/// the empty snapshot went out.
pub fn canalize(
    mut input: ItemReceiver,
    mut flush_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    aborts: AbortRegistry,
) -> (watch::Receiver<Vec<Upload>>, JoinHandle<()>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());

    let handle = tokio::spawn(async move {
        let mut snapshot = Snapshot::new();

        loop {
            tokio::select! {
                biased;
                Some(reply) = flush_rx.recv() => {
                    snapshot.clear();
                    snapshot_tx.send_replace(Vec::new());
                    tracing::debug!(target: "uploader", "uploads flushed");
                    let _ = reply.send(());
                }
                item = input.recv() => {
                    let Some(item) = item else { break };

                    let id = item.id().clone();
                    if !aborts.is_tracked(&id) {
                        tracing::trace!(target: "uploader", %id, "stale update dropped");
                        continue;
                    }

                    let Some(state) = snapshot.apply(item).map(|record| record.state) else {
                        continue;
                    };
                    if state.is_terminal() {
                        aborts.settle(&id);
                    }

                    snapshot_tx.send_replace(snapshot.to_vec());
                }
            }
        }
    });

    (snapshot_rx, handle)
}

/// Byte progress over every item that may still complete
pub fn progress_of(uploads: &[Upload]) -> Progress {
    uploads
        .iter()
        .filter(|upload| upload.state <= UploadState::Uploaded)
        .fold(Progress::default(), |mut progress, upload| {
            progress.uploaded += upload.uploaded;
            progress.total += upload.size;
            progress
        })
}
