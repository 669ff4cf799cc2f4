//! Collaborators the host application plugs into the pipeline.
//!
//! Every trait has a blanket implementation for plain closures, so a host can
//! pass functions directly instead of writing a type per concern.

use std::collections::HashMap;
use std::future::Future;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use super::errors::Result;
use super::types::{Confirmation, FileHandle, Thumb, TransferEvent, UploadId};

/// Raw file transform, e.g. HEIC to JPEG
#[async_trait]
pub trait Converter: Send + Sync {
    fn is_convertable(&self, file: &FileHandle) -> bool;

    async fn convert(&self, file: FileHandle) -> anyhow::Result<FileHandle>;
}

/// Converter built from a predicate and a transform function
pub struct FnConverter<P, C> {
    predicate: P,
    convert: C,
}

impl<P, C> FnConverter<P, C> {
    pub fn new(predicate: P, convert: C) -> Self {
        Self { predicate, convert }
    }
}

#[async_trait]
impl<P, C, Fut> Converter for FnConverter<P, C>
where
    P: Fn(&FileHandle) -> bool + Send + Sync,
    C: Fn(FileHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<FileHandle>> + Send,
{
    fn is_convertable(&self, file: &FileHandle) -> bool {
        (self.predicate)(file)
    }

    async fn convert(&self, file: FileHandle) -> anyhow::Result<FileHandle> {
        (self.convert)(file).await
    }
}

/// Returns the labels of every failed rule, empty when the file is valid
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, file: FileHandle) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl<F, Fut> Validator for F
where
    F: Fn(FileHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<String>>> + Send,
{
    async fn validate(&self, file: FileHandle) -> anyhow::Result<Vec<String>> {
        self(file).await
    }
}

type Rule = Box<dyn Fn(&FileHandle) -> bool + Send + Sync>;

/// Synchronous named rules; a rule returning `false` contributes its label
#[derive(Default)]
pub struct ValidationRules {
    rules: Vec<(String, Rule)>,
}

impl ValidationRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<F>(mut self, label: impl Into<String>, check: F) -> Self
    where
        F: Fn(&FileHandle) -> bool + Send + Sync + 'static,
    {
        self.rules.push((label.into(), Box::new(check)));
        self
    }

    pub fn check(&self, file: &FileHandle) -> Vec<String> {
        self.rules
            .iter()
            .filter(|(_, check)| !check(file))
            .map(|(label, _)| label.clone())
            .collect()
    }
}

#[async_trait]
impl Validator for ValidationRules {
    async fn validate(&self, file: FileHandle) -> anyhow::Result<Vec<String>> {
        Ok(self.check(&file))
    }
}

/// Local preview generation
#[async_trait]
pub trait ThumbnailProvider: Send + Sync {
    async fn thumbnail(&self, file: FileHandle) -> anyhow::Result<Thumb>;

    /// Releases a url this provider issued
    fn revoke(&self, _url: &str) {}
}

#[async_trait]
impl<F, Fut> ThumbnailProvider for F
where
    F: Fn(FileHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Thumb>> + Send,
{
    async fn thumbnail(&self, file: FileHandle) -> anyhow::Result<Thumb> {
        self(file).await
    }
}

/// Batched upload destination resolution
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn upload_urls(&self, ids: Vec<UploadId>) -> anyhow::Result<HashMap<UploadId, String>>;
}

#[async_trait]
impl<F, Fut> UrlResolver for F
where
    F: Fn(Vec<UploadId>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<UploadId, String>>> + Send,
{
    async fn upload_urls(&self, ids: Vec<UploadId>) -> anyhow::Result<HashMap<UploadId, String>> {
        self(ids).await
    }
}

/// Progressive transfer of one file to a resolved destination
pub trait Transfer: Send + Sync {
    fn transfer(
        &self,
        url: String,
        file: FileHandle,
        abort: CancellationToken,
    ) -> BoxStream<'static, anyhow::Result<TransferEvent>>;
}

impl<F> Transfer for F
where
    F: Fn(String, FileHandle, CancellationToken) -> BoxStream<'static, anyhow::Result<TransferEvent>> + Send + Sync,
{
    fn transfer(
        &self,
        url: String,
        file: FileHandle,
        abort: CancellationToken,
    ) -> BoxStream<'static, anyhow::Result<TransferEvent>> {
        self(url, file, abort)
    }
}

/// What the upload stage drives: progress events of one id, ending with
/// [`TransferEvent::Completed`] or an error
pub trait FileUploader: Send + Sync {
    fn upload(
        &self,
        id: UploadId,
        file: FileHandle,
        abort: CancellationToken,
    ) -> BoxStream<'static, Result<TransferEvent>>;
}

impl<F> FileUploader for F
where
    F: Fn(UploadId, FileHandle, CancellationToken) -> BoxStream<'static, Result<TransferEvent>> + Send + Sync,
{
    fn upload(
        &self,
        id: UploadId,
        file: FileHandle,
        abort: CancellationToken,
    ) -> BoxStream<'static, Result<TransferEvent>> {
        self(id, file, abort)
    }
}

/// Server side confirmation that an uploaded item was processed
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, id: UploadId) -> anyhow::Result<Confirmation>;
}

#[async_trait]
impl<F, Fut> Confirmer for F
where
    F: Fn(UploadId) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Confirmation>> + Send,
{
    async fn confirm(&self, id: UploadId) -> anyhow::Result<Confirmation> {
        self(id).await
    }
}
