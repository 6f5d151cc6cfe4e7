use crate::error::AppError;
use crate::models::media_types::FileCandidate;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
    ("tiff", "image/tiff"),
    ("tif", "image/tiff"),
    ("ico", "image/x-icon"),
    ("svg", "image/svg+xml"),
];

const VIDEO_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
];

/// MIME type guessed from the extension. Unknown extensions map to
/// `application/octet-stream`, which the controller rejects.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return "application/octet-stream",
    };

    IMAGE_TYPES
        .iter()
        .chain(VIDEO_TYPES.iter())
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

pub fn is_media_file(path: &Path) -> bool {
    let mime = mime_for_path(path);
    mime.starts_with("image/") || mime.starts_with("video/")
}

pub fn read_candidate(path: &Path) -> Result<FileCandidate, AppError> {
    let bytes = std::fs::read(path).map_err(|e| AppError {
        message: format!("Failed to read {}: {}", path.display(), e),
    })?;
    let name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    Ok(FileCandidate::new(name, mime_for_path(path), bytes))
}

/// Media files under `dir`, sorted case-insensitively by file name.
/// Hidden entries are skipped.
pub fn list_media_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, AppError> {
    if !dir.is_dir() {
        return Err(format!("Path does not exist: {}", dir.display()).into());
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_media_file(e.path()))
        .map(|e| e.into_path())
        .collect();

    files.sort_by_key(|p| {
        p.file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_lowercase()
    });

    Ok(files)
}
