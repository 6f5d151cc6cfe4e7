use crate::config::{Config, DispatchPolicy};
use crate::error::{BatchError, UploadError};
use crate::models::batch_types::{
    AddOutcome, BatchEvent, BatchPhase, BatchReport, BatchSnapshot, ExportRow, FileStatus, FileView,
    PreviewHandle, RejectReason, UploadPayload, UploadResult,
};
use crate::models::media_types::{FileCandidate, FileId, MediaKind, SelectedFile};
use crate::services::preview_service::{self, PreviewResourceManager};
use crate::services::result_exporter;
use crate::services::upload_client::MediaUploader;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;
const PROCESSING_FAILED: &str = "An error occurred while processing the files. Please try again.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    /// `None` accepts any number of files.
    pub max_files: Option<usize>,
    pub policy: DispatchPolicy,
}

impl From<&Config> for BatchOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_files: config.max_files,
            policy: config.policy,
        }
    }
}

struct Entry {
    file: SelectedFile,
    preview: PreviewHandle,
    status: FileStatus,
}

#[derive(Default)]
struct BatchState {
    entries: Vec<Entry>,
    phase: BatchPhase,
    details_open: Option<FileId>,
    over_limit: bool,
    message: Option<String>,
    /// Bumped by `clear()`; results dispatched under an older epoch are dropped.
    epoch: u64,
    next_id: u64,
}

impl BatchState {
    fn position(&self, id: FileId) -> Option<usize> {
        self.entries.iter().position(|e| e.file.id == id)
    }

    fn report(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for entry in &self.entries {
            match entry.status {
                FileStatus::Done(_) => report.done += 1,
                FileStatus::Failed(_) => report.failed += 1,
                FileStatus::Pending | FileStatus::InFlight => report.pending += 1,
            }
        }
        report
    }
}

/// Owns the current batch: selected files, their previews and per-file upload status.
///
/// Clones share the same batch, so one task can `clear()` while another awaits
/// `process()`. The state lock is never held across an await.
#[derive(Clone)]
pub struct BatchController {
    state: Arc<Mutex<BatchState>>,
    uploader: Arc<dyn MediaUploader>,
    previews: PreviewResourceManager,
    options: BatchOptions,
    events: broadcast::Sender<BatchEvent>,
}

impl BatchController {
    pub fn new(uploader: Arc<dyn MediaUploader>, previews: PreviewResourceManager, options: BatchOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BatchState::default())),
            uploader,
            previews,
            options,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut BatchState, phase: BatchPhase) {
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "batch phase changed");
            state.phase = phase;
            self.emit(BatchEvent::PhaseChanged(phase));
        }
    }

    fn is_full(&self, count: usize) -> bool {
        matches!(self.options.max_files, Some(max) if count >= max)
    }

    /// Accepts image and video candidates in order until the cap is reached.
    /// Everything else is reported back in `AddOutcome::rejected`.
    pub fn add_files(&self, candidates: Vec<FileCandidate>) -> Result<AddOutcome, BatchError> {
        let room = {
            let state = self.lock();
            if state.phase == BatchPhase::Processing {
                return Err(BatchError::Busy);
            }
            self.options.max_files.map(|max| max.saturating_sub(state.entries.len()))
        };

        // Thumbnails are decoded without the state lock held, and only for
        // candidates that can still fit.
        let mut budget = room;
        let prepared: Vec<_> = candidates
            .into_iter()
            .map(|candidate| {
                let kind = MediaKind::from_mime(&candidate.mime_type);
                let thumbnail = match kind {
                    Some(kind) if budget != Some(0) => {
                        if let Some(left) = budget.as_mut() {
                            *left -= 1;
                        }
                        preview_service::render_thumbnail(kind, &candidate.name, &candidate.bytes)
                    }
                    _ => None,
                };
                (candidate, kind, thumbnail)
            })
            .collect();

        let mut state = self.lock();
        if state.phase == BatchPhase::Processing {
            return Err(BatchError::Busy);
        }
        state.message = None;

        let mut outcome = AddOutcome::default();
        for (candidate, kind, thumbnail) in prepared {
            let kind = match kind {
                Some(kind) => kind,
                None => {
                    outcome.rejected.push((candidate.name, RejectReason::UnsupportedType));
                    continue;
                }
            };
            if self.is_full(state.entries.len()) {
                outcome.rejected.push((candidate.name, RejectReason::CapReached));
                continue;
            }

            let id = FileId(state.next_id);
            state.next_id += 1;

            let file = SelectedFile {
                id,
                name: candidate.name,
                mime_type: candidate.mime_type,
                kind,
                bytes: candidate.bytes,
            };
            let preview = self.previews.register(&file, thumbnail);
            state.entries.push(Entry {
                file,
                preview,
                status: FileStatus::Pending,
            });
            outcome.accepted.push(id);
        }

        state.over_limit = self.is_full(state.entries.len());
        if !outcome.accepted.is_empty() {
            self.set_phase(&mut state, BatchPhase::Selecting);
        }

        info!(
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            total = state.entries.len(),
            "files selected"
        );
        Ok(outcome)
    }

    /// Removes a file and revokes its preview. Refused while processing.
    pub fn delete_file(&self, id: FileId) -> Result<(), BatchError> {
        let mut state = self.lock();
        if state.phase == BatchPhase::Processing {
            return Err(BatchError::Busy);
        }
        let position = state.position(id).ok_or(BatchError::UnknownFile(id))?;

        let entry = state.entries.remove(position);
        if let Err(e) = self.previews.revoke(entry.preview.id) {
            warn!(file_id = %id, error = %e, "preview was already gone");
        }

        if state.details_open == Some(id) {
            state.details_open = None;
        }
        state.message = None;
        state.over_limit = self.is_full(state.entries.len());

        if state.entries.is_empty() {
            self.set_phase(&mut state, BatchPhase::Idle);
        }

        debug!(file_id = %id, position, "file deleted");
        Ok(())
    }

    /// Uploads every pending file according to the dispatch policy.
    pub async fn process(&self) -> Result<BatchReport, BatchError> {
        let (epoch, jobs) = {
            let mut state = self.lock();
            if state.phase == BatchPhase::Processing {
                return Err(BatchError::Busy);
            }
            state.message = None;

            if state.entries.is_empty() {
                state.message = Some(BatchError::EmptyBatch.to_string());
                warn!("process requested with no files selected");
                return Err(BatchError::EmptyBatch);
            }

            let jobs: Vec<SelectedFile> = state
                .entries
                .iter()
                .filter(|e| matches!(e.status, FileStatus::Pending))
                .map(|e| e.file.clone())
                .collect();

            if jobs.is_empty() {
                self.set_phase(&mut state, BatchPhase::Completed);
                return Ok(state.report());
            }

            self.set_phase(&mut state, BatchPhase::Processing);
            (state.epoch, jobs)
        };

        info!(files = jobs.len(), policy = ?self.options.policy, "processing batch");

        let guard = RunGuard {
            controller: self,
            epoch,
            armed: true,
        };
        let outcome = match self.options.policy {
            DispatchPolicy::Parallel => self.dispatch_parallel(epoch, jobs).await,
            DispatchPolicy::Sequential => self.dispatch_sequential(epoch, jobs).await,
        };
        guard.disarm();
        outcome
    }

    async fn dispatch_parallel(&self, epoch: u64, jobs: Vec<SelectedFile>) -> Result<BatchReport, BatchError> {
        for file in &jobs {
            self.mark_in_flight(epoch, file.id);
        }

        let mut pending: FuturesUnordered<_> = jobs
            .into_iter()
            .map(|file| {
                let uploader = self.uploader.clone();
                async move {
                    let result = uploader.submit(&file).await;
                    (file.id, result)
                }
            })
            .collect();

        while let Some((id, result)) = pending.next().await {
            self.settle(epoch, id, result);
        }

        Ok(self.finish(epoch))
    }

    async fn dispatch_sequential(&self, epoch: u64, jobs: Vec<SelectedFile>) -> Result<BatchReport, BatchError> {
        for file in jobs {
            // A cleared run has nothing left to report on.
            if !self.mark_in_flight(epoch, file.id) {
                return Ok(BatchReport::default());
            }

            let result = self.uploader.submit(&file).await;
            let failure = result.as_ref().err().cloned();

            if !self.settle(epoch, file.id, result) {
                return Ok(BatchReport::default());
            }

            if let Some(cause) = failure {
                let mut state = self.lock();
                state.message = Some(PROCESSING_FAILED.to_string());
                self.set_phase(&mut state, BatchPhase::Selecting);
                warn!(file_id = %file.id, error = %cause, remaining = state.report().pending, "batch stopped after failure");
                return Err(BatchError::Aborted {
                    failed: file.id,
                    cause,
                });
            }
        }

        Ok(self.finish(epoch))
    }

    /// False when the batch was cleared or the file removed since dispatch.
    fn mark_in_flight(&self, epoch: u64, id: FileId) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        match state.position(id) {
            Some(pos) => {
                state.entries[pos].status = FileStatus::InFlight;
                self.emit(BatchEvent::FileStarted(id));
                true
            }
            None => false,
        }
    }

    /// Records a finished upload. Returns false when the result was stale and dropped.
    fn settle(&self, epoch: u64, id: FileId, result: Result<UploadPayload, UploadError>) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!(file_id = %id, "dropping result for a cleared batch");
            return false;
        }
        let Some(pos) = state.position(id) else {
            debug!(file_id = %id, "dropping result for a removed file");
            return false;
        };

        let status = match result {
            Ok(payload) => {
                info!(file_id = %id, file = %state.entries[pos].file.name, elapsed_ms = payload.time_taken_ms, "file processed");
                FileStatus::Done(UploadResult {
                    file_id: id,
                    output: payload.output,
                    time_taken_ms: payload.time_taken_ms,
                })
            }
            Err(e) => {
                warn!(file_id = %id, file = %state.entries[pos].file.name, error = %e, "file failed");
                FileStatus::Failed(e)
            }
        };

        state.entries[pos].status = status.clone();
        self.emit(BatchEvent::FileFinished { id, status });
        true
    }

    fn finish(&self, epoch: u64) -> BatchReport {
        let mut state = self.lock();
        if state.epoch == epoch {
            self.set_phase(&mut state, BatchPhase::Completed);
            let report = state.report();
            info!(done = report.done, failed = report.failed, "batch completed");
            report
        } else {
            debug!("batch was cleared while processing");
            BatchReport::default()
        }
    }

    /// Drops every file and preview and returns to `Idle`, whatever the phase.
    pub fn clear(&self) {
        let mut state = self.lock();

        let revoked = self.previews.revoke_all();
        if revoked != state.entries.len() {
            warn!(revoked, files = state.entries.len(), "preview count did not match file count");
        }

        state.entries.clear();
        state.details_open = None;
        state.over_limit = false;
        state.message = None;
        state.epoch += 1;
        self.set_phase(&mut state, BatchPhase::Idle);

        info!(revoked, "batch cleared");
    }

    /// Opens the details view for `id`, or closes it if it is already open there.
    pub fn toggle_details(&self, id: FileId) {
        let mut state = self.lock();
        if state.position(id).is_none() {
            return;
        }
        state.details_open = if state.details_open == Some(id) { None } else { Some(id) };
    }

    pub fn phase(&self) -> BatchPhase {
        self.lock().phase
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.lock();
        BatchSnapshot {
            phase: state.phase,
            files: state
                .entries
                .iter()
                .enumerate()
                .map(|(position, e)| FileView {
                    position,
                    id: e.file.id,
                    name: e.file.name.clone(),
                    mime_type: e.file.mime_type.clone(),
                    kind: e.file.kind,
                    size_bytes: e.file.size_bytes(),
                    preview_url: e.preview.url.clone(),
                    status: e.status.clone(),
                })
                .collect(),
            details_open: state.details_open,
            over_limit: state.over_limit,
            message: state.message.clone(),
        }
    }

    /// One row per file with a terminal status, in selection order.
    pub fn results_in_order(&self) -> Vec<ExportRow> {
        let state = self.lock();
        state
            .entries
            .iter()
            .filter_map(|e| {
                let (class, time_taken_ms) = match &e.status {
                    FileStatus::Done(result) => (result.output.as_str().to_string(), result.time_taken_ms),
                    FileStatus::Failed(_) => ("Unknown".to_string(), 0),
                    FileStatus::Pending | FileStatus::InFlight => return None,
                };
                Some(ExportRow {
                    filename: e.file.name.clone(),
                    filetype: e.file.mime_type.clone(),
                    class,
                    time_taken_ms,
                })
            })
            .collect()
    }

    pub fn export_csv(&self) -> Result<String, BatchError> {
        if self.phase() != BatchPhase::Completed {
            return Err(BatchError::NotCompleted);
        }
        result_exporter::export(&self.results_in_order()).map_err(|e| BatchError::Export(e.message))
    }

    /// Writes `file_results.csv` into `dir`.
    pub fn save_csv(&self, dir: &Path) -> Result<PathBuf, BatchError> {
        if self.phase() != BatchPhase::Completed {
            return Err(BatchError::NotCompleted);
        }
        result_exporter::save(&self.results_in_order(), dir).map_err(|e| BatchError::Export(e.message))
    }
}

/// Returns an interrupted run to `Selecting` when `process()` is dropped before
/// it finishes, so its files can be dispatched again.
struct RunGuard<'a> {
    controller: &'a BatchController,
    epoch: u64,
    armed: bool,
}

impl RunGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.controller.lock();
        if state.epoch != self.epoch {
            return;
        }

        // Only one run can be in `Processing` per epoch, so every in-flight file is ours.
        let mut reset = 0;
        for entry in state.entries.iter_mut() {
            if entry.status == FileStatus::InFlight {
                entry.status = FileStatus::Pending;
                reset += 1;
            }
        }
        if state.phase == BatchPhase::Processing {
            self.controller.set_phase(&mut state, BatchPhase::Selecting);
        }
        warn!(reset, "processing interrupted, in-flight files returned to pending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch_types::ResultPayload;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Reply = Result<UploadPayload, UploadError>;

    /// Answers by file name: gated replies wait for the test to release them,
    /// scripted replies return at once, anything else is labelled `class-<name>`.
    #[derive(Default)]
    struct ScriptedUploader {
        replies: Mutex<HashMap<String, Reply>>,
        gates: Mutex<HashMap<String, oneshot::Receiver<Reply>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUploader {
        fn reply(&self, name: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(name.to_string(), reply);
        }

        fn gate(&self, name: &str) -> oneshot::Sender<Reply> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(name.to_string(), rx);
            tx
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaUploader for ScriptedUploader {
        async fn submit(&self, file: &SelectedFile) -> Result<UploadPayload, UploadError> {
            self.calls.lock().unwrap().push(file.name.clone());

            let gate = self.gates.lock().unwrap().remove(&file.name);
            if let Some(rx) = gate {
                return rx.await.unwrap_or_else(|_| Err(UploadError::Network("gate dropped".to_string())));
            }

            let scripted = self.replies.lock().unwrap().remove(&file.name);
            scripted.unwrap_or_else(|| Ok(label(&format!("class-{}", file.name), 10)))
        }
    }

    fn label(class: &str, ms: u64) -> UploadPayload {
        UploadPayload {
            output: ResultPayload::Label(class.to_string()),
            time_taken_ms: ms,
        }
    }

    fn candidate(name: &str, mime: &str) -> FileCandidate {
        FileCandidate::new(name, mime, vec![0u8; 2048])
    }

    fn controller(policy: DispatchPolicy, max_files: Option<usize>) -> (BatchController, Arc<ScriptedUploader>, PreviewResourceManager) {
        let uploader = Arc::new(ScriptedUploader::default());
        let previews = PreviewResourceManager::new();
        let ctl = BatchController::new(uploader.clone(), previews.clone(), BatchOptions { max_files, policy });
        (ctl, uploader, previews)
    }

    fn names(ctl: &BatchController) -> Vec<String> {
        ctl.snapshot().files.into_iter().map(|f| f.name).collect()
    }

    async fn wait_for_start(rx: &mut broadcast::Receiver<BatchEvent>, id: FileId) {
        loop {
            if let BatchEvent::FileStarted(started) = rx.recv().await.unwrap() {
                if started == id {
                    return;
                }
            }
        }
    }

    #[test]
    fn add_files_filters_types_and_moves_to_selecting() {
        let (ctl, _, previews) = controller(DispatchPolicy::Parallel, Some(5));
        assert_eq!(ctl.phase(), BatchPhase::Idle);

        let outcome = ctl
            .add_files(vec![
                candidate("a.png", "image/png"),
                candidate("notes.pdf", "application/pdf"),
                candidate("b.mp4", "video/mp4"),
            ])
            .unwrap();

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.rejected, vec![("notes.pdf".to_string(), RejectReason::UnsupportedType)]);
        assert_eq!(ctl.phase(), BatchPhase::Selecting);
        assert_eq!(names(&ctl), vec!["a.png", "b.mp4"]);
        assert_eq!(previews.live_count(), 2);

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.files[1].position, 1);
        assert_eq!(snapshot.files[1].size_kb(), 2);
        assert!(snapshot.files.iter().all(|f| f.status == FileStatus::Pending));
    }

    #[test]
    fn cap_takes_candidates_in_order_and_refuses_the_rest() {
        let (ctl, _, previews) = controller(DispatchPolicy::Parallel, Some(5));
        let batch: Vec<_> = (0..7).map(|i| candidate(&format!("{}.jpg", i), "image/jpeg")).collect();

        let outcome = ctl.add_files(batch).unwrap();
        assert_eq!(outcome.accepted.len(), 5);
        assert_eq!(
            outcome.rejected,
            vec![
                ("5.jpg".to_string(), RejectReason::CapReached),
                ("6.jpg".to_string(), RejectReason::CapReached),
            ]
        );
        assert!(ctl.snapshot().over_limit);

        let again = ctl.add_files(vec![candidate("late.jpg", "image/jpeg")]).unwrap();
        assert!(again.accepted.is_empty());
        assert_eq!(previews.live_count(), 5);

        ctl.delete_file(outcome.accepted[0]).unwrap();
        assert!(!ctl.snapshot().over_limit);
        let refill = ctl.add_files(vec![candidate("late.jpg", "image/jpeg")]).unwrap();
        assert_eq!(refill.accepted.len(), 1);
        assert_eq!(names(&ctl).last().unwrap(), "late.jpg");
    }

    #[test]
    fn uncapped_batch_accepts_everything() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, None);
        let batch: Vec<_> = (0..20).map(|i| candidate(&format!("{}.png", i), "image/png")).collect();
        assert_eq!(ctl.add_files(batch).unwrap().accepted.len(), 20);
        assert!(!ctl.snapshot().over_limit);
    }

    #[test]
    fn previews_track_live_files_through_adds_and_deletes() {
        let (ctl, _, previews) = controller(DispatchPolicy::Parallel, None);
        let ids = ctl
            .add_files((0..4).map(|i| candidate(&format!("{}.mp4", i), "video/mp4")).collect())
            .unwrap()
            .accepted;
        assert_eq!(previews.live_count(), 4);

        ctl.delete_file(ids[1]).unwrap();
        assert_eq!(previews.live_count(), ctl.snapshot().files.len());

        ctl.add_files(vec![candidate("x.webm", "video/webm")]).unwrap();
        assert_eq!(previews.live_count(), ctl.snapshot().files.len());

        ctl.delete_file(ids[0]).unwrap();
        ctl.delete_file(ids[2]).unwrap();
        ctl.delete_file(ids[3]).unwrap();
        assert_eq!(previews.live_count(), 1);
        assert_eq!(ctl.snapshot().files.len(), 1);

        assert_eq!(ctl.delete_file(ids[3]), Err(BatchError::UnknownFile(ids[3])));
        assert_eq!(previews.live_count(), 1);
    }

    #[test]
    fn deleting_shifts_later_positions_and_toggles_follow_their_file() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, None);
        let ids = ctl
            .add_files(vec![
                candidate("a.png", "image/png"),
                candidate("b.png", "image/png"),
                candidate("c.png", "image/png"),
                candidate("d.png", "image/png"),
            ])
            .unwrap()
            .accepted;

        ctl.toggle_details(ids[3]);
        ctl.delete_file(ids[1]).unwrap();

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.position_of(ids[0]), Some(0));
        assert_eq!(snapshot.position_of(ids[2]), Some(1));
        assert_eq!(snapshot.position_of(ids[3]), Some(2));
        assert_eq!(snapshot.details_open, Some(ids[3]));
        assert_eq!(snapshot.files[snapshot.position_of(ids[3]).unwrap()].name, "d.png");

        ctl.delete_file(ids[3]).unwrap();
        assert_eq!(ctl.snapshot().details_open, None);
        assert_eq!(names(&ctl), vec!["a.png", "c.png"]);
    }

    #[test]
    fn deleting_the_last_file_returns_to_idle() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, None);
        let ids = ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap().accepted;
        ctl.delete_file(ids[0]).unwrap();
        assert_eq!(ctl.phase(), BatchPhase::Idle);
    }

    #[test]
    fn toggle_details_opens_switches_and_closes() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, None);
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;

        ctl.toggle_details(ids[0]);
        assert_eq!(ctl.snapshot().details_open, Some(ids[0]));
        ctl.toggle_details(ids[1]);
        assert_eq!(ctl.snapshot().details_open, Some(ids[1]));
        ctl.toggle_details(ids[1]);
        assert_eq!(ctl.snapshot().details_open, None);
        ctl.toggle_details(FileId(999));
        assert_eq!(ctl.snapshot().details_open, None);
    }

    #[tokio::test]
    async fn processing_an_empty_batch_dispatches_nothing() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));

        assert_eq!(ctl.process().await, Err(BatchError::EmptyBatch));
        assert!(uploader.calls().is_empty());
        assert_eq!(ctl.phase(), BatchPhase::Idle);
        assert_eq!(
            ctl.snapshot().message.as_deref(),
            Some("Please upload at least one file before processing.")
        );

        ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap();
        assert_eq!(ctl.snapshot().message, None);
    }

    #[tokio::test]
    async fn parallel_failure_is_isolated_and_batch_completes() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        uploader.reply("b.mp4", Err(UploadError::Status(500)));
        ctl.add_files(vec![
            candidate("a.png", "image/png"),
            candidate("b.mp4", "video/mp4"),
            candidate("c.png", "image/png"),
        ])
        .unwrap();

        let report = ctl.process().await.unwrap();

        assert_eq!(report, BatchReport { done: 2, failed: 1, pending: 0 });
        assert_eq!(ctl.phase(), BatchPhase::Completed);
        let mut calls = uploader.calls();
        calls.sort();
        assert_eq!(calls, vec!["a.png", "b.mp4", "c.png"]);

        let snapshot = ctl.snapshot();
        assert!(matches!(snapshot.files[0].status, FileStatus::Done(_)));
        assert_eq!(snapshot.files[1].status, FileStatus::Failed(UploadError::Status(500)));
        assert!(matches!(snapshot.files[2].status, FileStatus::Done(_)));
        assert_eq!(snapshot.message, None);
    }

    #[tokio::test]
    async fn parallel_results_may_land_out_of_order() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        let slow = uploader.gate("a.png");
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;
        let mut events = ctl.subscribe();

        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });

        loop {
            if let BatchEvent::FileFinished { id, .. } = events.recv().await.unwrap() {
                assert_eq!(id, ids[1]);
                break;
            }
        }

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Processing);
        assert_eq!(snapshot.files[0].status, FileStatus::InFlight);
        assert!(matches!(snapshot.files[1].status, FileStatus::Done(_)));
        assert_eq!(snapshot.in_flight(), 1);

        slow.send(Ok(label("coverage", 120))).unwrap();
        let report = worker.await.unwrap().unwrap();
        assert_eq!(report.done, 2);
        assert_eq!(ctl.phase(), BatchPhase::Completed);
    }

    #[tokio::test]
    async fn sequential_failure_stops_the_queue() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Sequential, Some(5));
        uploader.reply("b.png", Err(UploadError::Network("reset".to_string())));
        let ids = ctl
            .add_files(vec![
                candidate("a.png", "image/png"),
                candidate("b.png", "image/png"),
                candidate("c.png", "image/png"),
            ])
            .unwrap()
            .accepted;

        let err = ctl.process().await.unwrap_err();

        assert_eq!(
            err,
            BatchError::Aborted {
                failed: ids[1],
                cause: UploadError::Network("reset".to_string()),
            }
        );
        assert_eq!(uploader.calls(), vec!["a.png", "b.png"]);

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Selecting);
        assert_eq!(snapshot.message.as_deref(), Some(PROCESSING_FAILED));
        assert!(matches!(snapshot.files[0].status, FileStatus::Done(_)));
        assert!(matches!(snapshot.files[1].status, FileStatus::Failed(_)));
        assert_eq!(snapshot.files[2].status, FileStatus::Pending);

        // Still usable: a fresh run resumes with what is left.
        let report = ctl.process().await.unwrap();
        assert_eq!(uploader.calls(), vec!["a.png", "b.png", "c.png"]);
        assert_eq!(report, BatchReport { done: 2, failed: 1, pending: 0 });
        assert_eq!(ctl.phase(), BatchPhase::Completed);
    }

    #[tokio::test]
    async fn sequential_dispatch_keeps_one_file_in_flight() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Sequential, Some(5));
        let first = uploader.gate("a.png");
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;
        let mut events = ctl.subscribe();

        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });
        wait_for_start(&mut events, ids[0]).await;

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.in_flight(), 1);
        assert_eq!(snapshot.files[1].status, FileStatus::Pending);
        assert_eq!(uploader.calls(), vec!["a.png"]);

        first.send(Ok(label("coverage", 5))).unwrap();
        worker.await.unwrap().unwrap();
        assert_eq!(uploader.calls(), vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn selection_is_frozen_while_processing() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        let gate = uploader.gate("a.png");
        let ids = ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap().accepted;
        let mut events = ctl.subscribe();

        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });
        wait_for_start(&mut events, ids[0]).await;

        assert_eq!(ctl.add_files(vec![candidate("b.png", "image/png")]).unwrap_err(), BatchError::Busy);
        assert_eq!(ctl.delete_file(ids[0]), Err(BatchError::Busy));
        assert_eq!(ctl.process().await, Err(BatchError::Busy));

        gate.send(Ok(label("coverage", 1))).unwrap();
        worker.await.unwrap().unwrap();
        assert_eq!(names(&ctl), vec!["a.png"]);
    }

    #[tokio::test]
    async fn clear_mid_processing_ignores_late_results() {
        let (ctl, uploader, previews) = controller(DispatchPolicy::Parallel, Some(5));
        let late = uploader.gate("a.png");
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;
        let mut events = ctl.subscribe();

        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });
        wait_for_start(&mut events, ids[0]).await;

        ctl.clear();
        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Idle);
        assert!(snapshot.files.is_empty());
        assert_eq!(previews.live_count(), 0);

        // New batch before the old response lands.
        ctl.add_files(vec![candidate("fresh.png", "image/png")]).unwrap();

        late.send(Ok(label("coverage", 120))).unwrap();
        assert_eq!(worker.await.unwrap().unwrap(), BatchReport::default());

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Selecting);
        assert_eq!(names(&ctl), vec!["fresh.png"]);
        assert_eq!(snapshot.files[0].status, FileStatus::Pending);
        assert_eq!(previews.live_count(), 1);

        ctl.process().await.unwrap();
        assert_eq!(ctl.phase(), BatchPhase::Completed);
    }

    #[tokio::test]
    async fn cleared_sequential_run_does_not_report_the_new_batch() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Sequential, Some(5));
        let late = uploader.gate("a.png");
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;
        let mut events = ctl.subscribe();

        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });
        wait_for_start(&mut events, ids[0]).await;

        ctl.clear();
        ctl.add_files(vec![candidate("fresh.png", "image/png")]).unwrap();

        late.send(Ok(label("coverage", 120))).unwrap();
        let report = worker.await.unwrap().unwrap();

        assert_eq!(report, BatchReport::default());
        assert_eq!(uploader.calls(), vec!["a.png"]);
        assert_eq!(ctl.snapshot().files[0].status, FileStatus::Pending);
        assert_eq!(ctl.phase(), BatchPhase::Selecting);
    }

    #[tokio::test]
    async fn dropped_process_returns_in_flight_files_to_pending() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        let _held = uploader.gate("a.png");
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.png", "image/png")])
            .unwrap()
            .accepted;

        let timed_out = tokio::time::timeout(Duration::from_millis(50), ctl.process()).await;
        assert!(timed_out.is_err());

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Selecting);
        assert_eq!(snapshot.files[0].status, FileStatus::Pending);
        assert!(matches!(snapshot.files[1].status, FileStatus::Done(_)));
        assert_eq!(snapshot.in_flight(), 0);

        ctl.delete_file(ids[1]).unwrap();
        let report = ctl.process().await.unwrap();
        assert_eq!(report, BatchReport { done: 1, failed: 0, pending: 0 });
        assert_eq!(ctl.phase(), BatchPhase::Completed);
        assert_eq!(names(&ctl), vec!["a.png"]);
    }

    #[tokio::test]
    async fn deleting_from_a_completed_batch_drops_its_result() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, Some(5));
        let ids = ctl
            .add_files(vec![candidate("a.png", "image/png"), candidate("b.mp4", "video/mp4")])
            .unwrap()
            .accepted;
        ctl.process().await.unwrap();

        ctl.delete_file(ids[0]).unwrap();

        assert_eq!(ctl.phase(), BatchPhase::Completed);
        assert_eq!(ctl.results_in_order().len(), 1);
        assert_eq!(
            ctl.export_csv().unwrap(),
            "Filename,Filetype,Class,Time taken (ms)\nb.mp4,video/mp4,class-b.mp4,10"
        );
    }

    #[tokio::test]
    async fn processing_with_nothing_pending_completes_without_dispatch() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Sequential, Some(5));
        uploader.reply("b.png", Err(UploadError::Status(502)));
        let ids = ctl
            .add_files(vec![
                candidate("a.png", "image/png"),
                candidate("b.png", "image/png"),
                candidate("c.png", "image/png"),
            ])
            .unwrap()
            .accepted;
        assert!(matches!(ctl.process().await, Err(BatchError::Aborted { .. })));

        ctl.delete_file(ids[2]).unwrap();
        let report = ctl.process().await.unwrap();

        assert_eq!(report, BatchReport { done: 1, failed: 1, pending: 0 });
        assert_eq!(ctl.phase(), BatchPhase::Completed);
        assert_eq!(uploader.calls(), vec!["a.png", "b.png"]);
        assert_eq!(ctl.snapshot().message, None);
    }

    #[test]
    fn thumbnails_are_rendered_only_for_files_that_fit() {
        let (ctl, _, previews) = controller(DispatchPolicy::Parallel, Some(1));
        let mut png = std::io::Cursor::new(Vec::new());
        image::RgbImage::from_pixel(64, 48, image::Rgb([10, 200, 10]))
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let png = png.into_inner();

        let outcome = ctl
            .add_files(vec![
                FileCandidate::new("a.png", "image/png", png.clone()),
                FileCandidate::new("b.png", "image/png", png),
            ])
            .unwrap();

        assert_eq!(outcome.rejected, vec![("b.png".to_string(), RejectReason::CapReached)]);
        assert!(ctl.snapshot().files[0].preview_url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(previews.live_count(), 1);
    }

    #[tokio::test]
    async fn clear_from_every_phase_resets_everything() {
        let (ctl, _, previews) = controller(DispatchPolicy::Parallel, Some(5));

        ctl.clear();
        assert_eq!(ctl.phase(), BatchPhase::Idle);

        ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap();
        ctl.clear();
        assert_eq!(ctl.phase(), BatchPhase::Idle);
        assert_eq!(previews.live_count(), 0);

        let ids = ctl
            .add_files((0..5).map(|i| candidate(&format!("{}.png", i), "image/png")).collect())
            .unwrap()
            .accepted;
        ctl.toggle_details(ids[2]);
        ctl.process().await.unwrap();
        assert_eq!(ctl.phase(), BatchPhase::Completed);
        ctl.clear();

        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.phase, BatchPhase::Idle);
        assert!(snapshot.files.is_empty());
        assert_eq!(snapshot.details_open, None);
        assert!(!snapshot.over_limit);
        assert!(ctl.results_in_order().is_empty());
        assert_eq!(previews.live_count(), 0);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_clear() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, Some(5));
        let first = ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap().accepted;
        ctl.clear();
        let second = ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap().accepted;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn adding_after_completion_only_dispatches_new_files() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap();
        ctl.process().await.unwrap();

        ctl.add_files(vec![candidate("b.mp4", "video/mp4")]).unwrap();
        assert_eq!(ctl.phase(), BatchPhase::Selecting);
        assert_eq!(ctl.export_csv(), Err(BatchError::NotCompleted));

        ctl.process().await.unwrap();
        assert_eq!(uploader.calls(), vec!["a.png", "b.mp4"]);
        assert_eq!(ctl.phase(), BatchPhase::Completed);
    }

    #[tokio::test]
    async fn export_is_in_selection_order_after_completion() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        let first = uploader.gate("a.png");
        uploader.reply("b.mp4", Ok(label("storytelling-videos", 900)));
        ctl.add_files(vec![candidate("a.png", "image/png"), candidate("b.mp4", "video/mp4")])
            .unwrap();

        assert_eq!(ctl.export_csv(), Err(BatchError::NotCompleted));

        let mut events = ctl.subscribe();
        let worker = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.process().await }
        });
        // b.mp4 lands first; the export must still list a.png first.
        loop {
            if let BatchEvent::FileFinished { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        first.send(Ok(label("coverage", 120))).unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(
            ctl.export_csv().unwrap(),
            "Filename,Filetype,Class,Time taken (ms)\na.png,image/png,coverage,120\nb.mp4,video/mp4,storytelling-videos,900"
        );
    }

    #[tokio::test]
    async fn failed_files_export_as_unknown() {
        let (ctl, uploader, _) = controller(DispatchPolicy::Parallel, Some(5));
        uploader.reply("a.png", Err(UploadError::Decode("bad json".to_string())));
        ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap();
        ctl.process().await.unwrap();

        let rows = ctl.results_in_order();
        assert_eq!(rows[0].class, "Unknown");
        assert_eq!(rows[0].time_taken_ms, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = ctl.save_csv(dir.path()).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().ends_with("a.png,image/png,Unknown,0"));
    }

    #[tokio::test]
    async fn phase_events_follow_the_lifecycle() {
        let (ctl, _, _) = controller(DispatchPolicy::Parallel, Some(5));
        let mut events = ctl.subscribe();

        ctl.add_files(vec![candidate("a.png", "image/png")]).unwrap();
        ctl.process().await.unwrap();
        ctl.clear();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BatchEvent::PhaseChanged(phase) = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                BatchPhase::Selecting,
                BatchPhase::Processing,
                BatchPhase::Completed,
                BatchPhase::Idle,
            ]
        );
    }
}
