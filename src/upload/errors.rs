use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use crate::utils::format_duration;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Item not found: {0}")]
    NotFound(String),

    /// Every key of a failed batch receives a clone of the same error
    #[error("Batch failed: {0}")]
    Batch(Arc<anyhow::Error>),

    #[error("No emission within {}", format_duration(*.0))]
    Timeout(Duration),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Transfer ended without completion")]
    Incomplete,

    #[error("Uploader shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl UploadError {
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound(key.to_string())
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(UploadError::Timeout(Duration::from_secs(3600)).to_string(), "No emission within 1h 0m 0s");
        assert_eq!(UploadError::not_found("42").to_string(), "Item not found: 42");

        let shared = UploadError::Batch(Arc::new(anyhow::anyhow!("storage unavailable")));
        assert_eq!(shared.to_string(), "Batch failed: storage unavailable");
    }
}
