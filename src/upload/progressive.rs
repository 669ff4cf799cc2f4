use std::collections::HashMap;
use std::sync::Arc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::{BatchConfig, UploaderConfig};
use crate::utils::Batched;
use super::errors::{Result, UploadError};
use super::traits::{FileUploader, Transfer, UrlResolver};
use super::types::{FileHandle, TransferEvent, UploadId};

struct TransferRequest {
    id: UploadId,
    file: FileHandle,
    abort: CancellationToken,
    events_tx: mpsc::UnboundedSender<Result<TransferEvent>>,
}

/// Progressive upload engine.
///
/// - destinations are resolved through one batched call per group of ids
/// - at most `rate_limit` transfers run at the same time (0 means no limit)
/// - each id gets its own event stream, errors only reach that id
/// - an abort tears down the transfer of that id and nothing else
///
/// The engine does not retry.
#[derive(Clone)]
pub struct ProgressiveUpload {
    request_tx: mpsc::UnboundedSender<TransferRequest>,
}

impl ProgressiveUpload {
    pub fn new(
        resolver: Arc<dyn UrlResolver>,
        transfer: Arc<dyn Transfer>,
        rate_limit: usize,
        batch: BatchConfig,
    ) -> Self {
        let urls = Batched::new(
            move |ids: Vec<UploadId>| {
                let resolver = resolver.clone();
                async move { resolver.upload_urls(ids).await }
            },
            batch.debounce,
            batch.limit,
        );

        let permits = if rate_limit == 0 { Semaphore::MAX_PERMITS } else { rate_limit };
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let worker = ProgressiveWorker {
            urls,
            transfer,
            semaphore: Arc::new(Semaphore::new(permits)),
            transfers: HashMap::new(),
            next_key: 0,
            completion_tx,
            completion_rx,
        };
        tokio::spawn(worker.run(request_rx));

        Self { request_tx }
    }

    pub fn from_config(resolver: Arc<dyn UrlResolver>, transfer: Arc<dyn Transfer>, config: &UploaderConfig) -> Self {
        Self::new(resolver, transfer, config.rate_limit, config.url_batch.clone())
    }
}

impl FileUploader for ProgressiveUpload {
    fn upload(
        &self,
        id: UploadId,
        file: FileHandle,
        abort: CancellationToken,
    ) -> BoxStream<'static, Result<TransferEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let request = TransferRequest { id, file, abort, events_tx };
        if self.request_tx.send(request).is_err() {
            return stream::once(async { Err(UploadError::Shutdown) }).boxed();
        }

        stream::unfold(events_rx, |mut events_rx| async move {
            events_rx.recv().await.map(|event| (event, events_rx))
        })
        .boxed()
    }
}

struct ProgressiveWorker {
    urls: Batched<UploadId, String>,
    transfer: Arc<dyn Transfer>,
    semaphore: Arc<Semaphore>,
    transfers: HashMap<u64, JoinHandle<()>>,
    next_key: u64,
    completion_tx: mpsc::UnboundedSender<u64>,
    completion_rx: mpsc::UnboundedReceiver<u64>,
}

impl ProgressiveWorker {
    async fn run(mut self, mut request_rx: mpsc::UnboundedReceiver<TransferRequest>) {
        let mut accepting = true;

        loop {
            tokio::select! {
                request = request_rx.recv(), if accepting => match request {
                    Some(request) => self.start(request),
                    None => accepting = false,
                },
                Some(key) = self.completion_rx.recv() => {
                    self.transfers.remove(&key);
                }
            }

            if !accepting && self.transfers.is_empty() {
                break;
            }
        }
    }

    fn start(&mut self, request: TransferRequest) {
        let key = self.next_key;
        self.next_key += 1;

        let urls = self.urls.clone();
        let transfer = self.transfer.clone();
        let semaphore = self.semaphore.clone();
        let completion_tx = self.completion_tx.clone();

        let handle = tokio::spawn(async move {
            drive(urls, transfer, semaphore, request).await;
            let _ = completion_tx.send(key);
        });

        self.transfers.insert(key, handle);
    }
}

impl Drop for ProgressiveWorker {
    fn drop(&mut self) {
        for handle in self.transfers.values() {
            handle.abort();
        }
    }
}

async fn drive(
    urls: Batched<UploadId, String>,
    transfer: Arc<dyn Transfer>,
    semaphore: Arc<Semaphore>,
    request: TransferRequest,
) {
    let TransferRequest { id, file, abort, events_tx } = request;

    let url = tokio::select! {
        biased;
        _ = abort.cancelled() => return,
        url = urls.get(id.clone()) => url,
    };
    let url = match url {
        Ok(url) => url,
        Err(err) => {
            tracing::debug!(target: "uploader", %id, %err, "upload url not resolved");
            let _ = events_tx.send(Err(err));
            return;
        }
    };

    let _permit = tokio::select! {
        biased;
        _ = abort.cancelled() => return,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                let _ = events_tx.send(Err(UploadError::Shutdown));
                return;
            }
        },
    };

    tracing::trace!(target: "uploader", %id, %url, "transfer started");
    let mut events = transfer.transfer(url, file, abort.clone());

    loop {
        let event = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            event = events.next() => event,
        };

        match event {
            Some(Ok(event)) => {
                let completed = event == TransferEvent::Completed;
                if events_tx.send(Ok(event)).is_err() || completed {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = events_tx.send(Err(UploadError::transfer(format!("{:#}", err))));
                return;
            }
            None => return,
        }
    }
}
