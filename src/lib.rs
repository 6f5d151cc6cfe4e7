pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::{ApiVariant, Config, DispatchPolicy};
pub use error::{AppError, BatchError, PreviewError, UploadError};
pub use models::batch_types::{BatchEvent, BatchPhase, BatchReport, BatchSnapshot, FileStatus, ResultPayload};
pub use models::media_types::{FileCandidate, FileId, MediaKind, SelectedFile};
pub use services::batch_controller::{BatchController, BatchOptions};
pub use services::preview_service::PreviewResourceManager;
pub use services::upload_client::{HttpUploadClient, MediaUploader};

use tracing_subscriber::EnvFilter;

/// Logs to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
