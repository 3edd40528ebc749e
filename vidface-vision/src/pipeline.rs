use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;
use std::sync::{Arc, Mutex};

use crate::face::{self, DetectedFace, EmbeddingExtractor, FACE_SIZE};
use crate::model::{self, ModelConfig};

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    pub detector: Session,
    pub encoder: Session,
    score_threshold: f32,
    nms_threshold: f32,
}

impl Pipeline {
    pub fn new(cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            detector: model::detector_session(cfg)?,
            encoder: model::recog_session(cfg)?,
            score_threshold: cfg.score_threshold,
            nms_threshold: cfg.nms_threshold,
        })
    }
}

impl EmbeddingExtractor for Pipeline {
    /// Every detected face, in detector order (descending score).
    fn extract(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let detections = face::detect_faces(
            &mut self.detector,
            img,
            self.score_threshold,
            self.nms_threshold,
        )
        .context("detecting faces")?;

        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let aligned = match face::align_face(img, &detection, FACE_SIZE) {
                Ok(aligned) => aligned,
                Err(e) => {
                    log::debug!("skipping face at {:?}: {}", detection.bbox, e);
                    continue;
                }
            };
            let embedding =
                face::encode_face(&mut self.encoder, &aligned).context("encoding face")?;
            faces.push(DetectedFace {
                detection,
                embedding,
            });
        }
        Ok(faces)
    }
}

/// Cloneable handle that serializes calls into one extractor.
///
/// ONNX sessions need `&mut` to run, so concurrent requests share the model through a lock
/// instead of loading it per request.
pub struct SharedExtractor {
    inner: Arc<Mutex<dyn EmbeddingExtractor + Send>>,
}

impl SharedExtractor {
    pub fn new<E: EmbeddingExtractor + Send + 'static>(extractor: E) -> Self {
        Self {
            inner: Arc::new(Mutex::new(extractor)),
        }
    }
}

impl Clone for SharedExtractor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl EmbeddingExtractor for SharedExtractor {
    fn extract(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("extractor lock poisoned"))?;
        guard.extract(img)
    }
}
