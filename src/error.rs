use crate::models::batch_types::PreviewId;
use crate::models::media_types::FileId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure of a single remote submission. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum UploadError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded with HTTP {0}")]
    Status(u16),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("could not build request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UploadError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            UploadError::Status(status.as_u16())
        } else {
            UploadError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("Please upload at least one file before processing.")]
    EmptyBatch,
    #[error("the batch is being processed")]
    Busy,
    #[error("no file {0} in the current batch")]
    UnknownFile(FileId),
    #[error("processing stopped at file {failed}: {cause}")]
    Aborted { failed: FileId, cause: UploadError },
    #[error("results can only be exported once processing has completed")]
    NotCompleted,
    #[error("export failed: {0}")]
    Export(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreviewError {
    #[error("preview {0:?} is not live (already revoked or never allocated)")]
    NotLive(PreviewId),
}

#[derive(Debug, Serialize)]
pub struct AppError {
    pub message: String,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError {
            message: err.to_string(),
        }
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError {
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError {
            message: format!("CSV error: {}", err),
        }
    }
}

impl From<BatchError> for AppError {
    fn from(err: BatchError) -> Self {
        AppError {
            message: err.to_string(),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        AppError {
            message: err.to_string(),
        }
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError { message: msg }
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError {
            message: msg.to_string(),
        }
    }
}
