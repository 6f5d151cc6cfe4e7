use crate::error::UploadError;
use crate::models::media_types::{FileId, MediaKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BatchPhase {
    #[default]
    Idle,
    Selecting,
    Processing,
    Completed,
}

/// What the remote side returned for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultPayload {
    Label(String),
    MediaUrl(String),
}

impl ResultPayload {
    pub fn as_str(&self) -> &str {
        match self {
            ResultPayload::Label(s) | ResultPayload::MediaUrl(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPayload {
    pub output: ResultPayload,
    pub time_taken_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub file_id: FileId,
    pub output: ResultPayload,
    pub time_taken_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InFlight,
    Done(UploadResult),
    Failed(UploadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PreviewId(pub u64);

/// Revocable local display reference for a selected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewHandle {
    pub id: PreviewId,
    pub owner: FileId,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnsupportedType,
    CapReached,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AddOutcome {
    pub accepted: Vec<FileId>,
    pub rejected: Vec<(String, RejectReason)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub position: usize,
    pub id: FileId,
    pub name: String,
    pub mime_type: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub preview_url: String,
    pub status: FileStatus,
}

impl FileView {
    /// Size as shown next to the file name.
    pub fn size_kb(&self) -> u64 {
        (self.size_bytes as f64 / 1024.0).round() as u64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub phase: BatchPhase,
    pub files: Vec<FileView>,
    pub details_open: Option<FileId>,
    pub over_limit: bool,
    pub message: Option<String>,
}

impl BatchSnapshot {
    pub fn in_flight(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, FileStatus::InFlight))
            .count()
    }

    pub fn position_of(&self, id: FileId) -> Option<usize> {
        self.files.iter().find(|f| f.id == id).map(|f| f.position)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BatchEvent {
    PhaseChanged(BatchPhase),
    FileStarted(FileId),
    FileFinished { id: FileId, status: FileStatus },
}

/// One CSV line in selection order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub filename: String,
    pub filetype: String,
    pub class: String,
    pub time_taken_ms: u64,
}
