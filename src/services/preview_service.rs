use crate::error::{AppError, PreviewError};
use crate::models::batch_types::{PreviewHandle, PreviewId};
use crate::models::media_types::{FileId, MediaKind, SelectedFile};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const THUMBNAIL_SIZE: u32 = 200;
const THUMBNAIL_QUALITY: u8 = 60;

/// Owner of every live preview handle.
///
/// Clones share the same registry, so the live count is the process-wide
/// number of outstanding handles.
#[derive(Clone, Default)]
pub struct PreviewResourceManager {
    live: Arc<Mutex<HashMap<PreviewId, FileId>>>,
    next_id: Arc<AtomicU64>,
}

impl PreviewResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PreviewId, FileId>> {
        // A poisoned registry still holds valid ids.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allocate(&self, file: &SelectedFile) -> PreviewHandle {
        let thumbnail = render_thumbnail(file.kind, &file.name, &file.bytes);
        self.register(file, thumbnail)
    }

    /// Records a handle for `file` using an already rendered thumbnail.
    /// Without one the handle gets an opaque URL.
    pub fn register(&self, file: &SelectedFile, thumbnail: Option<String>) -> PreviewHandle {
        let id = PreviewId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let url = thumbnail.unwrap_or_else(|| opaque_url(id));

        self.registry().insert(id, file.id);
        debug!(preview = id.0, file_id = %file.id, "preview allocated");

        PreviewHandle {
            id,
            owner: file.id,
            url,
        }
    }

    pub fn revoke(&self, id: PreviewId) -> Result<(), PreviewError> {
        match self.registry().remove(&id) {
            Some(owner) => {
                debug!(preview = id.0, file_id = %owner, "preview revoked");
                Ok(())
            }
            None => {
                warn!(preview = id.0, "revoke of a preview that is not live");
                Err(PreviewError::NotLive(id))
            }
        }
    }

    /// Releases every held handle and returns how many there were.
    pub fn revoke_all(&self) -> usize {
        let mut live = self.registry();
        let count = live.len();
        live.clear();
        if count > 0 {
            debug!(count, "all previews revoked");
        }
        count
    }

    pub fn is_live(&self, id: PreviewId) -> bool {
        self.registry().contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.registry().len()
    }
}

fn opaque_url(id: PreviewId) -> String {
    format!("blob:media-batch/preview-{}", id.0)
}

/// Thumbnail data URI for images that decode. Videos and broken images get `None`.
pub fn render_thumbnail(kind: MediaKind, name: &str, bytes: &[u8]) -> Option<String> {
    match kind {
        MediaKind::Image => match generate_thumbnail(bytes) {
            Ok(data_uri) => Some(data_uri),
            Err(e) => {
                debug!(file = %name, error = %e, "no thumbnail, using opaque preview");
                None
            }
        },
        MediaKind::Video => None,
    }
}

/// Small JPEG thumbnail of an in-memory image as a base64 data URI.
/// Respects EXIF orientation.
pub fn generate_thumbnail(bytes: &[u8]) -> Result<String, AppError> {
    let orientation = read_orientation(bytes);

    let mut img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AppError {
            message: format!("Failed to sniff image format: {}", e),
        })?
        .decode()?;

    let intermediate_size = THUMBNAIL_SIZE * 4;
    if img.width() > intermediate_size * 2 || img.height() > intermediate_size * 2 {
        img = img.resize(intermediate_size, intermediate_size, FilterType::Nearest);
    }
    img = img.resize(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

    if orientation != 1 {
        img = apply_orientation(img, orientation);
    }

    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, THUMBNAIL_QUALITY);
    // JPEG has no alpha channel
    img.to_rgb8().write_with_encoder(encoder)?;

    let b64 = base64::engine::general_purpose::STANDARD.encode(buffer.into_inner());
    Ok(format!("data:image/jpeg;base64,{}", b64))
}

/// EXIF orientation, 1 when absent or unreadable.
fn read_orientation(bytes: &[u8]) -> u32 {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(e) => e,
        Err(_) => return 1,
    };

    match exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
        Some(field) => match field.value {
            exif::Value::Short(ref v) => *v.first().unwrap_or(&1) as u32,
            exif::Value::Long(ref v) => *v.first().unwrap_or(&1),
            _ => 1,
        },
        None => 1,
    }
}

fn apply_orientation(img: image::DynamicImage, orientation: u32) -> image::DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate90(),
        6 => img.rotate90(),
        7 => img.fliph().rotate270(),
        8 => img.rotate270(),
        _ => img,
    }
}
