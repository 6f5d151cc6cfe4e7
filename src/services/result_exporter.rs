use crate::error::AppError;
use crate::models::batch_types::ExportRow;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use std::path::{Path, PathBuf};
use tracing::info;

pub const EXPORT_FILE_NAME: &str = "file_results.csv";
const HEADER: [&str; 4] = ["Filename", "Filetype", "Class", "Time taken (ms)"];

/// Header plus one line per row, newline separated, no trailing newline.
/// Fields are written verbatim.
pub fn export(rows: &[ExportRow]) -> Result<String, AppError> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(HEADER)?;
    for row in rows {
        let time_taken = row.time_taken_ms.to_string();
        writer.write_record([
            row.filename.as_str(),
            row.filetype.as_str(),
            row.class.as_str(),
            time_taken.as_str(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|e| AppError {
        message: format!("Failed to flush CSV: {}", e),
    })?;
    let mut text = String::from_utf8(bytes).map_err(|e| AppError {
        message: format!("CSV is not valid UTF-8: {}", e),
    })?;
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

/// Writes the export to `dir/file_results.csv`.
pub fn save(rows: &[ExportRow], dir: &Path) -> Result<PathBuf, AppError> {
    let text = export(rows)?;
    let path = dir.join(EXPORT_FILE_NAME);
    std::fs::write(&path, text).map_err(|e| AppError {
        message: format!("Failed to write {}: {}", path.display(), e),
    })?;
    info!(path = %path.display(), rows = rows.len(), "results exported");
    Ok(path)
}
