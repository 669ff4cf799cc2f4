use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use crate::upload::errors::{Result, UploadError};

struct BatchRequest<K, R> {
    key: K,
    reply: oneshot::Sender<Result<R>>,
}

/// Accumulates keyed requests and resolves them with one call per batch.
///
/// A batch is flushed when no key arrived for `debounce`, or as soon as it
/// holds `limit` keys. If the action fails, every key of that batch gets the
/// same error; a key missing from the result gets [`UploadError::NotFound`].
pub struct Batched<K, R> {
    request_tx: mpsc::UnboundedSender<BatchRequest<K, R>>,
}

impl<K, R> Clone for Batched<K, R> {
    fn clone(&self) -> Self {
        Self {
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<K, R> Batched<K, R>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<A, Fut>(action: A, debounce: Duration, limit: usize) -> Self
    where
        A: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HashMap<K, R>>> + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let worker = BatchWorker {
            action: Arc::new(action),
            debounce,
            limit: limit.max(1),
            pending: Vec::new(),
        };
        tokio::spawn(worker.run(request_rx));

        Self { request_tx }
    }

    /// Resolves exactly once with this key's own result
    pub async fn get(&self, key: K) -> Result<R> {
        let (reply, reply_rx) = oneshot::channel();

        self.request_tx
            .send(BatchRequest { key, reply })
            .map_err(|_| UploadError::Shutdown)?;

        reply_rx.await.map_err(|_| UploadError::Shutdown)?
    }
}

struct BatchWorker<K, R, A> {
    action: Arc<A>,
    debounce: Duration,
    limit: usize,
    pending: Vec<BatchRequest<K, R>>,
}

impl<K, R, A, Fut> BatchWorker<K, R, A>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    R: Clone + Send + 'static,
    A: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HashMap<K, R>>> + Send + 'static,
{
    async fn run(mut self, mut request_rx: mpsc::UnboundedReceiver<BatchRequest<K, R>>) {
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Some(request) => {
                        self.pending.push(request);
                        if self.pending.len() >= self.limit {
                            self.flush();
                            deadline = None;
                        } else {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    None => {
                        self.flush();
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                    deadline = None;
                }
            }
        }
    }

    fn flush(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return;
        }

        let mut keys: Vec<K> = Vec::with_capacity(batch.len());
        for request in &batch {
            if !keys.contains(&request.key) {
                keys.push(request.key.clone());
            }
        }

        tracing::trace!(target: "uploader", keys = keys.len(), "batch flushed");

        let action = self.action.clone();
        tokio::spawn(async move {
            match action(keys).await {
                Ok(items) => {
                    for request in batch {
                        let result = items
                            .get(&request.key)
                            .cloned()
                            .ok_or_else(|| UploadError::not_found(&request.key));
                        let _ = request.reply.send(result);
                    }
                }
                Err(err) => {
                    let err = Arc::new(err);
                    for request in batch {
                        let _ = request.reply.send(Err(UploadError::Batch(err.clone())));
                    }
                }
            }
        });
    }
}
