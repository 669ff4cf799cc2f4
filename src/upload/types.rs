use std::fmt;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::utils::format_bytes;

/// Opaque item identifier, unique among the items of one flush epoch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UploadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Item state, ascending order means more advanced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum UploadState {
    Enqueued = 0,
    Processing = 1,
    Uploading = 2,
    Uploaded = 3,
    Failed = 4,
    Aborted = 5,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        self >= UploadState::Uploaded
    }

    /// Failed and Aborted are never overwritten once recorded
    pub fn is_sticky(self) -> bool {
        self > UploadState::Uploaded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Thumb {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Public record of one item, as seen by a UI
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Upload {
    pub id: UploadId,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub uploaded: u64,
    pub state: UploadState,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb: Option<Thumb>,
}

/// Raw file handle supplied by the host
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub name: String,
    pub relative_path: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FileHandle {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            relative_path: String::new(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// HEIC either by content type, or by extension when the type is unknown
    pub fn is_heic(&self) -> bool {
        match self.content_type.as_deref() {
            Some(content_type) if !content_type.is_empty() => content_type == "image/heic",
            _ => self.name.to_lowercase().ends_with(".heic"),
        }
    }
}

/// An item that still carries its raw bytes
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub upload: Upload,
    pub file: FileHandle,
}

impl FileUpload {
    pub fn id(&self) -> &UploadId {
        &self.upload.id
    }
}

impl From<FileUpload> for Upload {
    fn from(item: FileUpload) -> Self {
        item.upload
    }
}

/// Enqueue request
#[derive(Debug, Clone)]
pub struct QueueUpload {
    pub id: UploadId,
    pub file: FileHandle,
}

impl QueueUpload {
    pub fn new(id: impl Into<UploadId>, file: FileHandle) -> Self {
        Self { id: id.into(), file }
    }
}

/// What flows between pipeline stages
#[derive(Debug, Clone)]
pub enum Item {
    File(FileUpload),
    Upload(Upload),
    /// Thumbnail update carrying no opinion on the item state
    Thumb { id: UploadId, thumb: Thumb },
}

impl Item {
    pub fn id(&self) -> &UploadId {
        match self {
            Item::File(item) => item.id(),
            Item::Upload(upload) => &upload.id,
            Item::Thumb { id, .. } => id,
        }
    }
}

/// Event reported by a transfer: bytes so far, or the completion sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Uploaded(u64),
    Completed,
}

/// Server side post-processing outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Confirmation {
    pub success: bool,
    pub thumb: Option<Thumb>,
}

/// Byte progress summed over the items that may still complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub uploaded: u64,
    pub total: u64,
}

impl Progress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.uploaded as f64 / self.total as f64 * 100.0
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} ({:.0}%)",
            format_bytes(self.uploaded),
            format_bytes(self.total),
            self.percentage()
        )
    }
}

// Items cross task boundaries
const _: fn() = || {
    fn assert_send<T: Send + Sync>() {}
    assert_send::<Item>();
    assert_send::<Upload>();
    assert_send::<TransferEvent>();
};
