//! Error types for watermark resolution and compositing

use crate::models::ResourceRef;
use std::path::PathBuf;

/// Main error type for watermarking operations
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: ResourceRef },

    #[error("Invalid assignment: {message}")]
    InvalidAssignment { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Failed to decode image: {message}")]
    ImageDecode { message: String },

    #[error("Failed to encode image: {message}")]
    ImageEncode { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Stored file not found: {path}")]
    Storage { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WatermarkError {
    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            WatermarkError::ResourceNotFound { .. } => "resource_not_found",
            WatermarkError::InvalidAssignment { .. } => "invalid_assignment",
            WatermarkError::InvalidArgument { .. } => "invalid_argument",
            WatermarkError::ImageDecode { .. } => "image_decode_error",
            WatermarkError::ImageEncode { .. } => "image_encode_error",
            WatermarkError::Persistence(_) => "persistence_error",
            WatermarkError::Storage { .. } => "storage_error",
            WatermarkError::Io(_) => "io_error",
            WatermarkError::Config { .. } => "config_error",
            WatermarkError::Logging { .. } => "logging_error",
            WatermarkError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the failure only concerns the item being processed.
    ///
    /// Batch callers log these and move on to the next item; anything else
    /// (a broken database, an unusable configuration) aborts the batch.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            WatermarkError::ResourceNotFound { .. }
                | WatermarkError::ImageDecode { .. }
                | WatermarkError::ImageEncode { .. }
                | WatermarkError::Storage { .. }
                | WatermarkError::Io(_)
        )
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        WatermarkError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_assignment(message: impl Into<String>) -> Self {
        WatermarkError::InvalidAssignment {
            message: message.into(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WatermarkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceType;

    #[test]
    fn test_error_types() {
        let error = WatermarkError::ResourceNotFound {
            resource: ResourceRef::new(ResourceType::Media, 42),
        };
        assert_eq!(error.error_type(), "resource_not_found");
        assert_eq!(error.to_string(), "Resource not found: media #42");
        assert!(error.is_item_local());
    }

    #[test]
    fn test_validation_errors_are_not_item_local() {
        let error = WatermarkError::invalid_argument("opacity out of range");
        assert_eq!(error.error_type(), "invalid_argument");
        assert!(!error.is_item_local());

        let error = WatermarkError::invalid_assignment("set 3 is disabled");
        assert_eq!(error.error_type(), "invalid_assignment");
        assert!(!error.is_item_local());
    }

    #[test]
    fn test_image_errors_are_item_local() {
        let error = WatermarkError::ImageDecode {
            message: "truncated".to_string(),
        };
        assert!(error.is_item_local());
        assert_eq!(error.error_type(), "image_decode_error");
    }
}
