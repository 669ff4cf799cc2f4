pub mod config;
pub mod upload;
pub mod utils;

pub use config::{BatchConfig, StageTimeouts, UploaderConfig};

pub use upload::{
    Confirmation,
    Confirmer,
    Converter,
    FileHandle,
    FileUploader,
    FnConverter,
    Pipeline,
    Progress,
    ProgressiveUpload,
    QueueUpload,
    Result,
    Thumb,
    ThumbnailProvider,
    Transfer,
    TransferEvent,
    Upload,
    UploadError,
    UploadId,
    UploadState,
    UploadView,
    Uploader,
    UrlResolver,
    ValidationRules,
    Validator,
};
