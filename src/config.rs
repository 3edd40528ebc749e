use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vidface_vision::ModelConfig;

use crate::identity::LabelStyle;
use crate::reference::FaceSelection;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("VIDFACE_CONFIG_PATH").unwrap_or("/usr/local/etc/vidface/config.toml"))
});

/// Default match threshold, in squared L2 over unit embeddings.
pub const DEFAULT_THRESHOLD: f32 = 0.6;
/// Frames drawn from each uploaded video.
pub const DEFAULT_SAMPLE_COUNT: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// A candidate matches when its nearest distance is strictly below this.
    pub threshold: f32,
    pub sample_count: usize,
    pub face_selection: FaceSelection,
    pub label_style: LabelStyle,
    pub reference_dir: PathBuf,
    pub video_dir: PathBuf,
    pub index_path: PathBuf,
    pub labels_path: PathBuf,
    /// Load `index_path`/`labels_path` at startup instead of re-extracting.
    pub reuse_index: bool,
    pub keep_uploads: bool,
    pub bind: String,
    /// Upper bound on one HTTP verification. Work still running when it expires stops at the
    /// next frame or extractor call.
    pub request_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub models: ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            sample_count: DEFAULT_SAMPLE_COUNT,
            face_selection: FaceSelection::default(),
            label_style: LabelStyle::default(),
            reference_dir: PathBuf::from("reference_faces"),
            video_dir: PathBuf::from("videos"),
            index_path: PathBuf::from("face_index.bin"),
            labels_path: PathBuf::from("face_labels.bin"),
            reuse_index: false,
            keep_uploads: true,
            bind: "0.0.0.0:8000".to_string(),
            request_timeout_secs: 120,
            max_upload_bytes: 512 * 1024 * 1024,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            models: ModelConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            anyhow::bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if self.sample_count == 0 {
            anyhow::bail!("sample_count must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
