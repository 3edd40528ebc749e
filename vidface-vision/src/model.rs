use anyhow::{Context, Result};
use ort::session::{
    builder::{GraphOptimizationLevel, SessionBuilder},
    Session,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Locations and tuning of the detector/recognizer pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// YuNet face detector (`face_detection_yunet_2023mar.onnx`).
    pub detector: PathBuf,
    /// SFace recognizer (`face_recognition_sface_2021dec.onnx`).
    pub recognizer: PathBuf,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector: PathBuf::from("models/face_detection_yunet_2023mar.onnx"),
            recognizer: PathBuf::from("models/face_recognition_sface_2021dec.onnx"),
            score_threshold: 0.6,
            nms_threshold: 0.3,
            intra_threads: 1,
        }
    }
}

pub fn session_builder(intra_threads: usize) -> Result<SessionBuilder> {
    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads.max(1))?)
}

fn load(path: &Path, intra_threads: usize, what: &str) -> Result<Session> {
    if !path.exists() {
        anyhow::bail!("{} model not found at {}", what, path.display());
    }
    session_builder(intra_threads)?
        .commit_from_file(path)
        .with_context(|| format!("load {} model {}", what, path.display()))
}

pub fn detector_session(cfg: &ModelConfig) -> Result<Session> {
    load(&cfg.detector, cfg.intra_threads, "detector")
}

pub fn recog_session(cfg: &ModelConfig) -> Result<Session> {
    load(&cfg.recognizer, cfg.intra_threads, "recognition")
}
