use std::sync::Arc;
use tokio::sync::mpsc;
use crate::config::UploaderConfig;
use super::abort::AbortRegistry;
use super::helpers::{ItemReceiver, StageOptions};
use super::operators::{
    self, ThumbLedger, CLIENT_THUMB_FAILED, POSTPROCESSING_FAILED, PREPROCESSING_FAILED, UPLOAD_FAILED,
    VALIDATION_FAILED,
};
use super::progressive::ProgressiveUpload;
use super::traits::{Confirmer, Converter, FileUploader, ThumbnailProvider, Transfer, UrlResolver, Validator};
use super::types::Upload;

/// What a stage can reach besides its input
#[derive(Clone)]
pub struct StageContext {
    pub aborts: AbortRegistry,
    pub thumbs: ThumbLedger,
    pub config: UploaderConfig,
}

impl StageContext {
    pub fn new(aborts: AbortRegistry, thumbs: ThumbLedger, config: UploaderConfig) -> Self {
        Self { aborts, thumbs, config }
    }
}

type Stage = Box<dyn FnOnce(ItemReceiver, &StageContext) -> ItemReceiver + Send>;

/// Ordered stages run between enqueue and reconciliation.
///
/// ```ignore
/// let pipeline = Pipeline::new()
///     .convert(heic_to_jpeg)
///     .validate(rules)
///     .client_thumb(previews)
///     .progressive(resolver, transfer)
///     .post_process(confirmer);
/// ```
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends any stage, e.g. one of [`operators`] with custom options
    pub fn stage<F>(mut self, stage: F) -> Self
    where
        F: FnOnce(ItemReceiver, &StageContext) -> ItemReceiver + Send + 'static,
    {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn convert(self, converter: impl Converter + 'static) -> Self {
        let converter: Arc<dyn Converter> = Arc::new(converter);
        self.stage(move |input, ctx| {
            let options = StageOptions::new(PREPROCESSING_FAILED).with_timeout(ctx.config.timeouts.convert);
            operators::pre_processing(input, ctx.aborts.clone(), converter, options)
        })
    }

    pub fn validate(self, validator: impl Validator + 'static) -> Self {
        let validator: Arc<dyn Validator> = Arc::new(validator);
        self.stage(move |input, ctx| {
            let options = StageOptions::new(VALIDATION_FAILED).with_timeout(ctx.config.timeouts.validate);
            operators::validate(input, ctx.aborts.clone(), validator, options)
        })
    }

    pub fn client_thumb(self, provider: impl ThumbnailProvider + 'static) -> Self {
        let provider: Arc<dyn ThumbnailProvider> = Arc::new(provider);
        self.stage(move |input, ctx| {
            let options = StageOptions::new(CLIENT_THUMB_FAILED).with_timeout(ctx.config.timeouts.thumbnail);
            operators::client_thumb(input, ctx.aborts.clone(), provider, ctx.thumbs.clone(), options)
        })
    }

    pub fn upload(self, uploader: impl FileUploader + 'static) -> Self {
        let uploader: Arc<dyn FileUploader> = Arc::new(uploader);
        self.stage(move |input, ctx| {
            let options = StageOptions::new(UPLOAD_FAILED).with_timeout(ctx.config.timeouts.upload);
            operators::upload(input, ctx.aborts.clone(), uploader, options)
        })
    }

    /// Upload stage backed by a [`ProgressiveUpload`] built from the uploader config
    pub fn progressive(self, resolver: impl UrlResolver + 'static, transfer: impl Transfer + 'static) -> Self {
        let resolver: Arc<dyn UrlResolver> = Arc::new(resolver);
        let transfer: Arc<dyn Transfer> = Arc::new(transfer);
        self.stage(move |input, ctx| {
            let engine: Arc<dyn FileUploader> = Arc::new(ProgressiveUpload::from_config(resolver, transfer, &ctx.config));
            let options = StageOptions::new(UPLOAD_FAILED).with_timeout(ctx.config.timeouts.upload);
            operators::upload(input, ctx.aborts.clone(), engine, options)
        })
    }

    pub fn post_process(self, confirmer: impl Confirmer + 'static) -> Self {
        let confirmer: Arc<dyn Confirmer> = Arc::new(confirmer);
        self.stage(move |input, ctx| {
            let options = StageOptions::new(POSTPROCESSING_FAILED).with_timeout(ctx.config.timeouts.post_process);
            operators::post_processing(input, confirmer, options)
        })
    }

    pub fn merge_external(self, external: mpsc::UnboundedReceiver<Upload>) -> Self {
        self.stage(move |input, ctx| operators::merge_external(input, external, ctx.aborts.clone()))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Chains every stage in insertion order
    pub fn run(self, input: ItemReceiver, ctx: &StageContext) -> ItemReceiver {
        self.stages.into_iter().fold(input, |items, stage| stage(items, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::traits::ValidationRules;
    use crate::upload::types::{FileHandle, FileUpload, Item, UploadState};

    fn context() -> StageContext {
        StageContext::new(AbortRegistry::new(), ThumbLedger::new(), UploaderConfig::default())
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = Pipeline::new()
            .validate(ValidationRules::new().rule("empty", |file: &FileHandle| file.size() > 0))
            .stage(|mut input, _ctx| {
                let (output_tx, output_rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(item) = input.recv().await {
                        if let Item::File(item) = item {
                            let _ = output_tx.send(Item::Upload(item.upload));
                        }
                    }
                });
                output_rx
            });
        assert_eq!(pipeline.len(), 2);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut output = pipeline.run(input_rx, &context());

        let file = FileHandle::new("a.jpg", vec![1u8]);
        let upload = Upload {
            id: "1".into(),
            name: file.name.clone(),
            path: String::new(),
            size: file.size(),
            uploaded: 0,
            state: UploadState::Enqueued,
            errors: Vec::new(),
            thumb: None,
        };
        input_tx.send(Item::File(FileUpload { upload, file })).unwrap();
        drop(input_tx);

        // the custom stage keeps only items still carrying a file
        match output.recv().await {
            Some(Item::Upload(upload)) => assert_eq!(upload.state, UploadState::Processing),
            other => panic!("unexpected {:?}", other),
        }
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_pipeline_forwards_input() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut output = pipeline.run(input_rx, &context());
        input_tx.send(Item::Thumb { id: "1".into(), thumb: crate::upload::types::Thumb { url: "u".into(), width: 1, height: 1 } }).unwrap();

        assert!(matches!(output.recv().await, Some(Item::Thumb { .. })));
    }
}
