use clap::{Parser, ValueEnum};
use media_batch_lib::models::batch_types::{FileView, RejectReason};
use media_batch_lib::services::fs_service;
use media_batch_lib::{
    ApiVariant, AppError, BatchController, BatchError, BatchEvent, BatchOptions, BatchPhase, Config,
    DispatchPolicy, FileCandidate, FileId, FileStatus, HttpUploadClient, PreviewResourceManager,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "media-batch", version, about = "Send images and videos to a classification API and export the results")]
struct Cli {
    /// Files or directories to upload
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Base URL of the remote API [env: API_BASE_URL]
    #[arg(long)]
    api_url: Option<String>,

    /// Endpoint family exposed by the API [env: API_VARIANT, default: classify]
    #[arg(long, value_enum)]
    variant: Option<ApiVariant>,

    /// Upload all files at once or one after another [env: DISPATCH_POLICY, default: parallel]
    #[arg(long, value_enum)]
    policy: Option<DispatchPolicy>,

    /// Maximum number of files per batch, 0 for no limit [env: MAX_FILES, default: 5]
    #[arg(long)]
    max_files: Option<usize>,

    /// Descend into sub-directories
    #[arg(short, long)]
    recursive: bool,

    /// Directory that receives file_results.csv
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Skip writing the CSV export
    #[arg(long)]
    no_export: bool,
}

impl Cli {
    /// Flags given on the command line, keyed like the environment variables they override.
    fn setting(&self, key: &str) -> Option<String> {
        match key {
            "API_BASE_URL" => self.api_url.clone(),
            "API_VARIANT" => self.variant.and_then(|v| value_name(&v)),
            "DISPATCH_POLICY" => self.policy.and_then(|p| value_name(&p)),
            "MAX_FILES" => self.max_files.map(|n| n.to_string()),
            _ => None,
        }
    }

    fn candidates(&self) -> Result<Vec<FileCandidate>, AppError> {
        let mut candidates = Vec::new();
        for input in &self.inputs {
            if input.is_dir() {
                for path in fs_service::list_media_files(input, self.recursive)? {
                    candidates.push(fs_service::read_candidate(&path)?);
                }
            } else {
                candidates.push(fs_service::read_candidate(input)?);
            }
        }
        Ok(candidates)
    }
}

fn value_name<T: ValueEnum>(value: &T) -> Option<String> {
    value.to_possible_value().map(|v| v.get_name().to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    media_batch_lib::init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    let config = Config::from_env_with(|key| cli.setting(key))?;
    let uploader = Arc::new(HttpUploadClient::from_config(&config));
    let controller = BatchController::new(uploader, PreviewResourceManager::new(), BatchOptions::from(&config));

    let outcome = controller.add_files(cli.candidates()?)?;
    for (name, reason) in &outcome.rejected {
        let why = match reason {
            RejectReason::UnsupportedType => "not an image or video",
            RejectReason::CapReached => "selection limit reached",
        };
        println!("skipped {}: {}", name, why);
    }

    let events = controller.subscribe();
    let names: Vec<(FileId, String)> = controller
        .snapshot()
        .files
        .into_iter()
        .map(|f| (f.id, f.name))
        .collect();
    let progress = tokio::spawn(async move {
        for line in progress_lines(events, &names).await {
            println!("{}", line);
        }
    });

    let result = controller.process().await;
    match &result {
        // The run ended with a phase change, so the task stops on its own once
        // every queued event is printed.
        Ok(_) | Err(BatchError::Aborted { .. }) => {
            if let Err(e) = progress.await {
                error!(error = %e, "progress printer failed");
            }
        }
        Err(_) => progress.abort(),
    }

    let snapshot = controller.snapshot();
    println!();
    for file in &snapshot.files {
        println!("{}", describe(file));
    }

    match result {
        Ok(report) => {
            println!("\n{} done, {} failed", report.done, report.failed);
            if !cli.no_export {
                let path = controller.save_csv(&cli.output)?;
                println!("results written to {}", path.display());
            }
            Ok(if report.failed > 0 { ExitCode::from(2) } else { ExitCode::SUCCESS })
        }
        Err(BatchError::EmptyBatch) => {
            println!("{}", BatchError::EmptyBatch);
            Ok(ExitCode::FAILURE)
        }
        Err(e @ BatchError::Aborted { .. }) => {
            if let Some(message) = snapshot.message {
                println!("\n{}", message);
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Collects one line per finished file until the run leaves `Processing`.
async fn progress_lines(mut events: broadcast::Receiver<BatchEvent>, names: &[(FileId, String)]) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                lines.push(format!("({} progress updates skipped)", skipped));
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            BatchEvent::FileFinished { id, status } => {
                let name = names
                    .iter()
                    .find(|(known, _)| *known == id)
                    .map(|(_, n)| n.as_str())
                    .unwrap_or("?");
                match status {
                    FileStatus::Done(result) => lines.push(format!("done    {} ({} ms)", name, result.time_taken_ms)),
                    FileStatus::Failed(e) => lines.push(format!("failed  {}: {}", name, e)),
                    _ => {}
                }
            }
            BatchEvent::PhaseChanged(BatchPhase::Completed | BatchPhase::Selecting | BatchPhase::Idle) => break,
            _ => {}
        }
    }
    lines
}

fn describe(file: &FileView) -> String {
    let detail = match &file.status {
        FileStatus::Done(result) => format!("{} ({} ms)", result.output.as_str(), result.time_taken_ms),
        FileStatus::Failed(e) => format!("failed: {}", e),
        FileStatus::Pending => "not processed".to_string(),
        FileStatus::InFlight => "processing".to_string(),
    };
    format!(
        "{:>2}. {:<32} {:>8} KB  {}",
        file.position + 1,
        file.name,
        file.size_kb(),
        detail
    )
}
