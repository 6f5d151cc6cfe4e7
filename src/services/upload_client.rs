use crate::config::{normalize_base_url, ApiVariant, Config};
use crate::error::UploadError;
use crate::models::batch_types::{ResultPayload, UploadPayload};
use crate::models::media_types::{MediaKind, SelectedFile};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, error};

/// Remote capability that turns one selected file into a result payload.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn submit(&self, file: &SelectedFile) -> Result<UploadPayload, UploadError>;
}

#[derive(Deserialize)]
struct LabelResponse {
    #[serde(alias = "fileClass", alias = "label")]
    class: String,
}

#[derive(Deserialize)]
struct UrlResponse {
    url: String,
}

#[derive(Clone)]
pub struct HttpUploadClient {
    client: reqwest::Client,
    base_url: String,
    variant: ApiVariant,
}

impl HttpUploadClient {
    pub fn new(base_url: &str, variant: ApiVariant) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, variant)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, variant: ApiVariant) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            variant,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_base_url, config.variant)
    }

    pub fn endpoint(&self, kind: MediaKind) -> String {
        let path = match kind {
            MediaKind::Image => self.variant.image_path(),
            MediaKind::Video => self.variant.video_path(),
        };
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl MediaUploader for HttpUploadClient {
    async fn submit(&self, file: &SelectedFile) -> Result<UploadPayload, UploadError> {
        let url = self.endpoint(file.kind);

        let part = Part::bytes(file.bytes.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| UploadError::Request(format!("invalid content type {}: {}", file.mime_type, e)))?;
        let form = Form::new().part("file", part);

        let start = Instant::now();

        let response = self.client.post(&url).multipart(form).send().await.map_err(|e| {
            error!(file = %file.name, error = %e, "upload failed");
            UploadError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(file = %file.name, status = status.as_u16(), "upload rejected");
            return Err(UploadError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response.bytes().await?;

        let output = decode_payload(self.variant, file, content_type.as_deref(), &body)?;
        let time_taken_ms = start.elapsed().as_millis() as u64;

        debug!(file = %file.name, elapsed_ms = time_taken_ms, "upload finished");

        Ok(UploadPayload {
            output,
            time_taken_ms,
        })
    }
}

fn decode_payload(
    variant: ApiVariant,
    file: &SelectedFile,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ResultPayload, UploadError> {
    match (variant, file.kind) {
        (ApiVariant::Classify, _) => {
            let parsed: LabelResponse =
                serde_json::from_slice(body).map_err(|e| UploadError::Decode(e.to_string()))?;
            Ok(ResultPayload::Label(parsed.class))
        }
        (ApiVariant::Process, MediaKind::Image) => {
            if body.is_empty() {
                return Err(UploadError::Decode("empty media body".to_string()));
            }
            let mime = content_type
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
                .filter(|ct| !ct.is_empty())
                .unwrap_or(&file.mime_type);
            let b64 = base64::engine::general_purpose::STANDARD.encode(body);
            Ok(ResultPayload::MediaUrl(format!("data:{};base64,{}", mime, b64)))
        }
        (ApiVariant::Process, MediaKind::Video) => {
            let parsed: UrlResponse =
                serde_json::from_slice(body).map_err(|e| UploadError::Decode(e.to_string()))?;
            Ok(ResultPayload::MediaUrl(parsed.url))
        }
    }
}
