//! Pipeline stages.
//!
//! Every stage takes the receiving half of the previous stage and returns the
//! receiving half of its own output. Items a stage does not apply to are
//! forwarded untouched; picked items are handled concurrently, one task each.

use std::sync::{Arc, Mutex};
use futures::StreamExt;
use tokio::sync::mpsc;
use super::abort::{AbortRegistry, Lifeline};
use super::errors::UploadError;
use super::helpers::{fork_each, if_file_upload, to_failed, to_upload, until_abort, within, ItemReceiver, ItemSender, StageOptions};
use super::timeout_stream::FirstTimeout;
use super::traits::{Confirmer, Converter, FileUploader, ThumbnailProvider, Validator};
use super::types::{FileUpload, Item, QueueUpload, TransferEvent, Upload, UploadState};

pub const PREPROCESSING_FAILED: &str = "preprocessing failed";
pub const VALIDATION_FAILED: &str = "validation failed";
pub const CLIENT_THUMB_FAILED: &str = "client thumb failed";
pub const UPLOAD_FAILED: &str = "upload failed";
pub const POSTPROCESSING_FAILED: &str = "postprocessing failed";

/// Turns enqueue requests into items and watches each one for an abort.
///
/// An aborted item gets exactly one `Aborted` update from here, unless it
/// settled first or its registration was replaced by a flush.
pub fn enqueue(mut input: mpsc::UnboundedReceiver<QueueUpload>, aborts: AbortRegistry) -> ItemReceiver {
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(QueueUpload { id, file }) = input.recv().await {
            let lifeline = aborts.lifeline(&id).unwrap_or_else(|| aborts.register(&id));

            let upload = Upload {
                id: id.clone(),
                name: file.name.clone(),
                path: file.relative_path.clone(),
                size: file.size(),
                uploaded: 0,
                state: UploadState::Enqueued,
                errors: Vec::new(),
                thumb: None,
            };

            tracing::debug!(target: "uploader", %id, name = %upload.name, size = upload.size, "enqueued");

            let watched = upload.clone();
            if output_tx.send(Item::File(FileUpload { upload, file })).is_err() {
                break;
            }

            tokio::spawn(watch_abort(watched, lifeline, aborts.clone(), output_tx.clone()));
        }
    });

    output_rx
}

async fn watch_abort(upload: Upload, lifeline: Lifeline, aborts: AbortRegistry, output: ItemSender) {
    tokio::select! {
        biased;
        _ = lifeline.settled.cancelled() => {}
        _ = lifeline.abort.cancelled() => {
            if aborts.is_current(&upload.id, lifeline.generation) {
                tracing::debug!(target: "uploader", id = %upload.id, "aborted");
                let _ = output.send(Item::Upload(to_upload(upload, Some(UploadState::Aborted))));
            }
        }
    }
}

/// Converts files the converter claims, e.g. HEIC to JPEG.
///
/// Other files skip the stage entirely, without a `Processing` update.
pub fn pre_processing(
    input: ItemReceiver,
    aborts: AbortRegistry,
    converter: Arc<dyn Converter>,
    options: StageOptions,
) -> ItemReceiver {
    let predicate = converter.clone();

    if_file_upload(
        input,
        move |item| predicate.is_convertable(&item.file),
        move |item, output| {
            let (aborts, converter, options) = (aborts.clone(), converter.clone(), options.clone());

            async move {
                let FileUpload { upload, file } = item;
                let mut upload = to_upload(upload, Some(UploadState::Processing));
                tracing::debug!(target: "uploader", id = %upload.id, "preprocessing");
                let _ = output.send(Item::Upload(upload.clone()));

                let abort = aborts.signal(&upload.id);
                match until_abort(&abort, options.timeout, converter.convert(file)).await {
                    None => {}
                    Some(Ok(file)) => {
                        upload.name = file.name.clone();
                        upload.size = file.size();
                        tracing::debug!(target: "uploader", id = %upload.id, name = %upload.name, "preprocessed");
                        let _ = output.send(Item::File(FileUpload { upload, file }));
                    }
                    Some(Err(err)) => {
                        tracing::error!(target: "uploader", id = %upload.id, error = %format!("{:#}", err), "{}", options.error_text);
                        let _ = output.send(Item::Upload(to_failed(upload, [options.error_text])));
                    }
                }
            }
        },
    )
}

/// Fails items the validator reports labels for, all labels are kept
pub fn validate(
    input: ItemReceiver,
    aborts: AbortRegistry,
    validator: Arc<dyn Validator>,
    options: StageOptions,
) -> ItemReceiver {
    if_file_upload(
        input,
        |_| true,
        move |item, output| {
            let (aborts, validator, options) = (aborts.clone(), validator.clone(), options.clone());

            async move {
                let FileUpload { upload, file } = item;
                let upload = to_upload(upload, Some(UploadState::Processing));
                tracing::debug!(target: "uploader", id = %upload.id, "validation");
                let _ = output.send(Item::Upload(upload.clone()));

                let abort = aborts.signal(&upload.id);
                match until_abort(&abort, options.timeout, validator.validate(file.clone())).await {
                    None => {}
                    Some(Ok(errors)) if errors.is_empty() => {
                        tracing::debug!(target: "uploader", id = %upload.id, "valid");
                        let _ = output.send(Item::File(FileUpload { upload, file }));
                    }
                    Some(Ok(errors)) => {
                        tracing::debug!(target: "uploader", id = %upload.id, ?errors, "invalid");
                        let _ = output.send(Item::Upload(to_failed(upload, errors)));
                    }
                    Some(Err(err)) => {
                        tracing::error!(target: "uploader", id = %upload.id, error = %format!("{:#}", err), "{}", options.error_text);
                        let _ = output.send(Item::Upload(to_failed(upload, [options.error_text])));
                    }
                }
            }
        },
    )
}

/// Thumbnail urls issued during the current epoch, with the provider that
/// has to release each of them
#[derive(Clone, Default)]
pub struct ThumbLedger {
    issued: Arc<Mutex<Vec<(String, Arc<dyn ThumbnailProvider>)>>>,
}

impl ThumbLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, url: impl Into<String>, provider: Arc<dyn ThumbnailProvider>) {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((url.into(), provider));
    }

    pub fn len(&self) -> usize {
        self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revokes every recorded url once and forgets it, returns how many
    pub fn revoke_all(&self) -> usize {
        let issued = std::mem::take(&mut *self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        for (url, provider) in &issued {
            tracing::trace!(target: "uploader", %url, "thumb revoked");
            provider.revoke(url);
        }

        issued.len()
    }
}

/// Best effort local preview.
///
/// The item moves on right away; the thumb follows as a separate update that
/// leaves the state alone. A failure is only a warning.
pub fn client_thumb(
    input: ItemReceiver,
    aborts: AbortRegistry,
    provider: Arc<dyn ThumbnailProvider>,
    ledger: ThumbLedger,
    options: StageOptions,
) -> ItemReceiver {
    if_file_upload(
        input,
        |_| true,
        move |item, output| {
            let (aborts, provider, ledger, options) = (aborts.clone(), provider.clone(), ledger.clone(), options.clone());

            async move {
                let id = item.id().clone();
                let file = item.file.clone();
                tracing::debug!(target: "uploader", %id, "client thumb");
                let _ = output.send(Item::File(item));

                let abort = aborts.signal(&id);
                match until_abort(&abort, options.timeout, provider.thumbnail(file)).await {
                    None => {}
                    Some(Ok(thumb)) => {
                        ledger.record(thumb.url.clone(), provider.clone());
                        let _ = output.send(Item::Thumb { id, thumb });
                    }
                    Some(Err(err)) => {
                        tracing::warn!(target: "uploader", %id, error = %format!("{:#}", err), "{}", options.error_text);
                    }
                }
            }
        },
    )
}

/// Drives the transfer of every item still carrying a file.
///
/// Byte progress becomes `Uploading` updates, the completion sentinel the
/// final `Uploaded` one. Only the first event is timed.
pub fn upload(
    input: ItemReceiver,
    aborts: AbortRegistry,
    uploader: Arc<dyn FileUploader>,
    options: StageOptions,
) -> ItemReceiver {
    if_file_upload(
        input,
        |_| true,
        move |item, output| {
            let (aborts, uploader, options) = (aborts.clone(), uploader.clone(), options.clone());

            async move {
                let FileUpload { upload, file } = item;
                let upload = to_upload(upload, Some(UploadState::Uploading));
                tracing::debug!(target: "uploader", id = %upload.id, "uploading");
                let _ = output.send(Item::Upload(upload.clone()));

                let abort = aborts.signal(&upload.id);
                let events = uploader.upload(upload.id.clone(), file, abort.clone());
                let mut events = Box::pin(FirstTimeout::new(events, options.timeout));

                loop {
                    let event = tokio::select! {
                        biased;
                        _ = abort.cancelled() => return,
                        event = events.next() => event,
                    };

                    let failure = match event {
                        Some(Ok(TransferEvent::Uploaded(bytes))) => {
                            let mut progress = upload.clone();
                            progress.uploaded = bytes.min(progress.size);
                            tracing::trace!(target: "uploader", id = %upload.id, "uploading {}/{}", progress.uploaded, progress.size);
                            let _ = output.send(Item::Upload(progress));
                            continue;
                        }
                        Some(Ok(TransferEvent::Completed)) => {
                            let mut done = to_upload(upload, Some(UploadState::Uploaded));
                            done.uploaded = done.size;
                            tracing::debug!(target: "uploader", id = %done.id, "uploaded");
                            let _ = output.send(Item::Upload(done));
                            return;
                        }
                        Some(Err(err)) => err,
                        None => UploadError::Incomplete,
                    };

                    tracing::error!(target: "uploader", id = %upload.id, error = %failure, "{}", options.error_text);
                    let _ = output.send(Item::Upload(to_failed(upload, [options.error_text])));
                    return;
                }
            }
        },
    )
}

/// Server side confirmation of uploaded items.
///
/// Not abortable: the bytes already left.
pub fn post_processing(input: ItemReceiver, confirmer: Arc<dyn Confirmer>, options: StageOptions) -> ItemReceiver {
    fork_each(
        input,
        |item| match item {
            Item::Upload(upload) if upload.state == UploadState::Uploaded => Ok(upload),
            other => Err(other),
        },
        move |upload: Upload, output: ItemSender| {
            let (confirmer, options) = (confirmer.clone(), options.clone());

            async move {
                let mut upload = to_upload(upload, Some(UploadState::Uploading));
                tracing::debug!(target: "uploader", id = %upload.id, "postprocessing");
                let _ = output.send(Item::Upload(upload.clone()));

                let confirmation = match within(options.timeout, confirmer.confirm(upload.id.clone())).await {
                    Ok(confirmation) => confirmation,
                    Err(err) => {
                        tracing::error!(target: "uploader", id = %upload.id, error = %format!("{:#}", err), "confirmation failed");
                        Default::default()
                    }
                };

                if confirmation.success {
                    upload.state = UploadState::Uploaded;
                    if confirmation.thumb.is_some() {
                        upload.thumb = confirmation.thumb;
                    }
                    tracing::debug!(target: "uploader", id = %upload.id, "postprocessed");
                    let _ = output.send(Item::Upload(upload));
                } else {
                    tracing::error!(target: "uploader", id = %upload.id, "{}", options.error_text);
                    let _ = output.send(Item::Upload(to_failed(upload, [options.error_text])));
                }
            }
        },
    )
}

/// Mixes finished records from outside the pipeline into the item stream.
///
/// Only `Uploaded` and `Failed` records are accepted. They are registered
/// with `aborts` so the reconciliation keeps them.
pub fn merge_external(
    mut input: ItemReceiver,
    mut external: mpsc::UnboundedReceiver<Upload>,
    aborts: AbortRegistry,
) -> ItemReceiver {
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut input_open = true;
        let mut external_open = true;

        while input_open || external_open {
            tokio::select! {
                item = input.recv(), if input_open => match item {
                    Some(item) => {
                        if output_tx.send(item).is_err() {
                            break;
                        }
                    }
                    None => input_open = false,
                },
                upload = external.recv(), if external_open => match upload {
                    Some(upload) if matches!(upload.state, UploadState::Uploaded | UploadState::Failed) => {
                        aborts.register(&upload.id);
                        tracing::debug!(target: "uploader", id = %upload.id, "externally injected");
                        if output_tx.send(Item::Upload(upload)).is_err() {
                            break;
                        }
                    }
                    Some(upload) => {
                        tracing::warn!(target: "uploader", id = %upload.id, state = ?upload.state, "external record ignored");
                    }
                    None => external_open = false,
                },
            }
        }
    });

    output_rx
}
