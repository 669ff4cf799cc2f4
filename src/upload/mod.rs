pub mod abort;
pub mod canalize;
pub mod errors;
pub mod helpers;
pub mod operators;
pub mod pipeline;
pub mod progressive;
mod timeout_stream;
pub mod traits;
pub mod types;
pub mod uploader;

pub use abort::AbortRegistry;
pub use canalize::{canalize, Snapshot};
pub use errors::{Result, UploadError};
pub use helpers::{to_failed, to_upload, ItemReceiver, ItemSender, StageOptions};
pub use operators::ThumbLedger;
pub use pipeline::{Pipeline, StageContext};
pub use progressive::ProgressiveUpload;
pub use timeout_stream::FirstTimeout;
pub use traits::{Confirmer, Converter, FileUploader, FnConverter, ThumbnailProvider, Transfer, UrlResolver, ValidationRules, Validator};
pub use types::{Confirmation, FileHandle, FileUpload, Item, Progress, QueueUpload, Thumb, TransferEvent, Upload, UploadId, UploadState};
pub use uploader::{UploadView, Uploader};
