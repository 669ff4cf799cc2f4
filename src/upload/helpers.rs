use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::errors::UploadError;
use super::types::{FileUpload, Item, Upload, UploadState};

pub type ItemSender = mpsc::UnboundedSender<Item>;
pub type ItemReceiver = mpsc::UnboundedReceiver<Item>;

/// Strips the file handle, optionally overriding the state
pub fn to_upload(item: impl Into<Upload>, state: Option<UploadState>) -> Upload {
    let mut upload = item.into();
    if let Some(state) = state {
        upload.state = state;
    }
    upload
}

/// Forces `Failed`, appending `errors` to the ones already collected
pub fn to_failed<S: Into<String>>(item: impl Into<Upload>, errors: impl IntoIterator<Item = S>) -> Upload {
    let mut upload = to_upload(item, Some(UploadState::Failed));
    upload.errors.extend(errors.into_iter().map(Into::into));
    upload
}

/// Per-stage knobs: first-result timeout and the error label used on failure
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub timeout: Option<Duration>,
    pub error_text: String,
}

impl StageOptions {
    pub fn new(error_text: impl Into<String>) -> Self {
        Self {
            timeout: None,
            error_text: error_text.into(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Routes every item either to a concurrently spawned `handler` or straight
/// to the output.
///
/// `pick` returns `Ok` for items this stage works on and hands anything else
/// back as `Err` to be forwarded untouched.
pub fn fork_each<T, P, H, Fut>(mut input: ItemReceiver, pick: P, handler: H) -> ItemReceiver
where
    T: Send + 'static,
    P: Fn(Item) -> Result<T, Item> + Send + 'static,
    H: Fn(T, ItemSender) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            match pick(item) {
                Ok(picked) => {
                    tokio::spawn(handler(picked, output_tx.clone()));
                }
                Err(item) => {
                    if output_tx.send(item).is_err() {
                        break;
                    }
                }
            }
        }
    });

    output_rx
}

/// [`fork_each`] over items that still carry a file and satisfy `predicate`
pub fn if_file_upload<P, H, Fut>(input: ItemReceiver, predicate: P, handler: H) -> ItemReceiver
where
    P: Fn(&FileUpload) -> bool + Send + 'static,
    H: Fn(FileUpload, ItemSender) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fork_each(
        input,
        move |item| match item {
            Item::File(upload) if predicate(&upload) => Ok(upload),
            other => Err(other),
        },
        handler,
    )
}

/// Runs `work`, failing with [`UploadError::Timeout`] when it outlives `timeout`
pub async fn within<T, F>(timeout: Option<Duration>, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| anyhow::Error::new(UploadError::Timeout(limit)))?,
        None => work.await,
    }
}

/// Runs `work` until it resolves, times out, or `abort` fires.
///
/// `None` means aborted; the caller must not emit anything for the item then.
pub async fn until_abort<T, F>(
    abort: &CancellationToken,
    timeout: Option<Duration>,
    work: F,
) -> Option<anyhow::Result<T>>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        result = within(timeout, work) => Some(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::types::UploadId;

    fn sample() -> Upload {
        Upload {
            id: UploadId::from("1"),
            name: "a.jpg".to_string(),
            path: String::new(),
            size: 4,
            uploaded: 0,
            state: UploadState::Processing,
            errors: vec!["first".to_string()],
            thumb: None,
        }
    }

    #[test]
    fn test_to_upload_and_failed() {
        assert_eq!(to_upload(sample(), None).state, UploadState::Processing);
        assert_eq!(to_upload(sample(), Some(UploadState::Uploading)).state, UploadState::Uploading);

        let failed = to_failed(sample(), ["second"]);
        assert_eq!(failed.state, UploadState::Failed);
        assert_eq!(failed.errors, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_abort_outcomes() {
        let abort = CancellationToken::new();

        let done = until_abort(&abort, None, async { Ok(1) }).await;
        assert_eq!(done.unwrap().unwrap(), 1);

        let slow = until_abort(&abort, Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(2)
        })
        .await;
        let err = slow.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<UploadError>(), Some(UploadError::Timeout(_))));

        abort.cancel();
        let aborted = until_abort(&abort, None, async { Ok(3) }).await;
        assert!(aborted.is_none());
    }

    #[tokio::test]
    async fn test_fork_each_passes_unpicked_items() {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut output = fork_each(
            input_rx,
            |item| match item {
                Item::Upload(upload) if upload.size > 10 => Ok(upload),
                other => Err(other),
            },
            |upload: Upload, out: ItemSender| async move {
                let _ = out.send(Item::Upload(to_upload(upload, Some(UploadState::Uploaded))));
            },
        );

        let mut big = sample();
        big.size = 100;
        input_tx.send(Item::Upload(sample())).unwrap();
        input_tx.send(Item::Upload(big)).unwrap();
        drop(input_tx);

        let mut states = Vec::new();
        while let Some(Item::Upload(upload)) = output.recv().await {
            states.push((upload.size, upload.state));
        }
        states.sort_by_key(|(size, _)| *size);
        assert_eq!(states, vec![(4, UploadState::Processing), (100, UploadState::Uploaded)]);
    }
}
