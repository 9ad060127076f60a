use anyhow::{Context, Result};
use rollcall_core::PipelineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Where the daemon loads the enrolled roster from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceLocation {
    /// Base URL of the web service exposing `/api/get_embeddings`.
    Http(String),
    /// JSON array on disk.
    File(PathBuf),
}

/// Which D-Bus bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub reference: ReferenceLocation,
    /// Period between scheduled reference refreshes.
    pub refresh_interval: Duration,
    /// Bound on a single reference fetch.
    pub refresh_timeout: Duration,
    /// Bound on the startup load; past it the daemon starts with an empty roster.
    pub initial_load_timeout: Duration,
    /// Bound on one identify request.
    pub identify_timeout: Duration,
    pub bus: Bus,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    ///
    /// `ROLLCALL_PIPELINE_CONFIG` may name a TOML file overriding detection and
    /// matching parameters; a file that does not parse or validate is an error.
    pub fn from_env() -> Result<Self> {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let reference = match std::env::var("ROLLCALL_REFERENCE_FILE") {
            Ok(path) => ReferenceLocation::File(PathBuf::from(path)),
            Err(_) => ReferenceLocation::Http(
                std::env::var("ROLLCALL_REFERENCE_URL").unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
            ),
        };

        let pipeline = match std::env::var("ROLLCALL_PIPELINE_CONFIG") {
            Ok(path) => load_pipeline_config(&PathBuf::from(path))?,
            Err(_) => PipelineConfig::default(),
        };

        Ok(Self {
            model_dir,
            reference,
            refresh_interval: Duration::from_secs(env_u64("ROLLCALL_REFRESH_INTERVAL_SECS", 3600).max(1)),
            refresh_timeout: Duration::from_secs(env_u64("ROLLCALL_REFRESH_TIMEOUT_SECS", 30)),
            initial_load_timeout: Duration::from_secs(env_u64("ROLLCALL_INITIAL_LOAD_SECS", 10)),
            identify_timeout: Duration::from_secs(env_u64("ROLLCALL_IDENTIFY_TIMEOUT_SECS", 60)),
            bus: match std::env::var("ROLLCALL_BUS").as_deref() {
                Ok("system") => Bus::System,
                _ => Bus::Session,
            },
            pipeline,
        })
    }

    /// Path to the YOLOv8-face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("yolov8n-face.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

pub fn load_pipeline_config(path: &std::path::Path) -> Result<PipelineConfig> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config {}", path.display()))?;
    PipelineConfig::from_toml(&src).with_context(|| format!("invalid pipeline config {}", path.display()))
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
