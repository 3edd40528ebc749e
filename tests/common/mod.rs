#![allow(dead_code)]

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vidface::{DetectedFace, Embedding, EmbeddingExtractor};
use vidface_vision::face::Detection;
use vidface_vision::{FrameSource, VideoDecoder};

pub fn init_logging() {
    env_logger::try_init().ok();
}

/// Unit vector in the plane at `angle` radians.
pub fn unit(angle: f32) -> Embedding {
    Embedding::from_unit(vec![angle.cos(), angle.sin()])
}

pub fn solid(color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb(color))
}

/// Recognizes "faces" by the colour of an image's top-left pixel.
#[derive(Clone, Default)]
pub struct ColorExtractor {
    faces: HashMap<[u8; 3], Vec<Embedding>>,
    calls: Arc<AtomicUsize>,
    fail_on: Option<[u8; 3]>,
}

impl ColorExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, color: [u8; 3], faces: Vec<Embedding>) -> Self {
        self.faces.insert(color, faces);
        self
    }

    pub fn failing_on(mut self, color: [u8; 3]) -> Self {
        self.fail_on = Some(color);
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingExtractor for ColorExtractor {
    fn extract(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = img.to_rgb8().get_pixel(0, 0).0;
        if self.fail_on == Some(key) {
            anyhow::bail!("extractor crashed on {:?}", key);
        }
        let faces = self.faces.get(&key).cloned().unwrap_or_default();
        Ok(faces
            .into_iter()
            .enumerate()
            .map(|(i, embedding)| DetectedFace {
                detection: Detection {
                    bbox: [i as f32 * 10.0, 0.0, 10.0, 10.0],
                    score: 0.9,
                    landmarks: [0.0; 10],
                },
                embedding,
            })
            .collect())
    }
}

/// In-memory video.
pub struct ScriptedVideo {
    pub advertised: usize,
    pub frames: Vec<RgbImage>,
    pub read: usize,
}

impl ScriptedVideo {
    pub fn of(colors: &[[u8; 3]]) -> Self {
        Self {
            advertised: colors.len(),
            frames: colors.iter().copied().map(solid).collect(),
            read: 0,
        }
    }
}

impl FrameSource for ScriptedVideo {
    fn frame_count(&self) -> usize {
        self.advertised
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let frame = self.frames.get(self.read).cloned();
        self.read += 1;
        Ok(frame)
    }
}

/// Treats every byte of a file as one frame whose red channel is that byte.
pub struct ByteVideoDecoder;

impl VideoDecoder for ByteVideoDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let bytes = std::fs::read(path)?;
        let colors: Vec<[u8; 3]> = bytes.iter().map(|&b| [b, 0, 0]).collect();
        Ok(Box::new(ScriptedVideo::of(&colors)))
    }
}
