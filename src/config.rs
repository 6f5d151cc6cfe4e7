use crate::error::AppError;
use clap::ValueEnum;
use serde::Serialize;
use std::str::FromStr;

pub const DEFAULT_MAX_FILES: usize = 5;

/// Which pair of remote endpoints the deployment exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ValueEnum)]
pub enum ApiVariant {
    /// `/upload_image`, `/upload_video`, JSON label responses.
    Classify,
    /// `/process-image`, `/process-video`, processed media responses.
    Process,
}

impl ApiVariant {
    pub fn image_path(&self) -> &'static str {
        match self {
            ApiVariant::Classify => "/upload_image",
            ApiVariant::Process => "/process-image",
        }
    }

    pub fn video_path(&self) -> &'static str {
        match self {
            ApiVariant::Classify => "/upload_video",
            ApiVariant::Process => "/process-video",
        }
    }
}

impl FromStr for ApiVariant {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classify" => Ok(ApiVariant::Classify),
            "process" => Ok(ApiVariant::Process),
            other => Err(format!("Unknown API variant: {}", other).into()),
        }
    }
}

/// How `process()` dispatches the pending files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ValueEnum)]
pub enum DispatchPolicy {
    /// All pending files at once; failures stay with their file.
    #[default]
    Parallel,
    /// One at a time in selection order; the first failure stops the batch.
    Sequential,
}

impl FromStr for DispatchPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(DispatchPolicy::Parallel),
            "sequential" => Ok(DispatchPolicy::Sequential),
            other => Err(format!("Unknown dispatch policy: {}", other).into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Config {
    pub api_base_url: String,
    pub variant: ApiVariant,
    pub policy: DispatchPolicy,
    pub max_files: Option<usize>,
}

impl Config {
    pub fn new(api_base_url: &str) -> Self {
        Self {
            api_base_url: normalize_base_url(api_base_url),
            variant: ApiVariant::Classify,
            policy: DispatchPolicy::Parallel,
            max_files: Some(DEFAULT_MAX_FILES),
        }
    }

    /// Reads `API_BASE_URL`, `API_VARIANT`, `DISPATCH_POLICY` and `MAX_FILES`
    /// from the environment. Any key `overrides` answers wins over the environment.
    pub fn from_env_with<F>(overrides: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(|key| overrides(key).or_else(|| std::env::var(key).ok()))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = lookup("API_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::from("API_BASE_URL is not set"))?;

        let mut config = Config::new(&base);

        if let Some(v) = lookup("API_VARIANT") {
            config.variant = v.parse()?;
        }
        if let Some(v) = lookup("DISPATCH_POLICY") {
            config.policy = v.parse()?;
        }
        if let Some(v) = lookup("MAX_FILES") {
            config.max_files = parse_max_files(&v)?;
        }

        Ok(config)
    }
}

/// `0` means no cap.
pub fn parse_max_files(value: &str) -> Result<Option<usize>, AppError> {
    let n = value.trim().parse::<usize>().map_err(|e| AppError {
        message: format!("Invalid MAX_FILES value {:?}: {}", value, e),
    })?;
    Ok(if n == 0 { None } else { Some(n) })
}

pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
