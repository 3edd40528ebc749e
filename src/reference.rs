//! Reference database: labeled embeddings of the known identities.
//!
//! Built once from a directory of images. Row `i` of the embedding matrix always belongs to
//! `labels[i]`; the two are never reordered independently.

use anyhow::{Context, Result};
use image::DynamicImage;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vidface_vision::{DetectedFace, Embedding, EmbeddingExtractor};

use crate::identity::{self, LabelStyle};

/// Which face of a multi-face reference image becomes the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSelection {
    /// First face in extractor order.
    #[default]
    First,
    /// Largest bounding box.
    Largest,
    /// Highest detector score.
    MostConfident,
}

impl FaceSelection {
    pub fn select(self, faces: Vec<DetectedFace>) -> Option<DetectedFace> {
        match self {
            FaceSelection::First => faces.into_iter().next(),
            FaceSelection::Largest => faces
                .into_iter()
                .reduce(|best, f| if f.detection.area() > best.detection.area() { f } else { best }),
            FaceSelection::MostConfident => faces
                .into_iter()
                .reduce(|best, f| if f.detection.score > best.detection.score { f } else { best }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceRecord {
    pub label: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDatabase {
    labels: Vec<String>,
    embeddings: Array2<f32>,
}

impl ReferenceDatabase {
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            embeddings: Array2::zeros((0, 0)),
        }
    }

    /// Stack records into an N×D matrix. All embeddings must share one dimensionality.
    pub fn from_records(records: Vec<ReferenceRecord>) -> Result<Self> {
        let Some(dim) = records.first().map(|r| r.embedding.dim()) else {
            return Ok(Self::empty());
        };
        let mut labels = Vec::with_capacity(records.len());
        let mut data = Vec::with_capacity(records.len() * dim);
        for record in records {
            if record.embedding.dim() != dim {
                anyhow::bail!(
                    "embedding for {} has dimension {}, expected {}",
                    record.label,
                    record.embedding.dim(),
                    dim
                );
            }
            data.extend_from_slice(record.embedding.as_slice());
            labels.push(record.label);
        }
        let embeddings = Array2::from_shape_vec((labels.len(), dim), data)?;
        Ok(Self { labels, embeddings })
    }

    /// Pair an existing matrix with its labels, e.g. after loading both from disk.
    pub fn from_parts(labels: Vec<String>, embeddings: Array2<f32>) -> Result<Self> {
        if labels.len() != embeddings.nrows() {
            anyhow::bail!(
                "{} labels for {} embedding rows",
                labels.len(),
                embeddings.nrows()
            );
        }
        Ok(Self { labels, embeddings })
    }

    /// Scan `dir` in sorted filename order and extract one embedding per image.
    ///
    /// Files that are not decodable images, or in which no face is found, are skipped. A
    /// missing or unreadable directory is an error.
    pub fn build_from_dir(
        dir: &Path,
        extractor: &mut dyn EmbeddingExtractor,
        selection: FaceSelection,
        style: LabelStyle,
    ) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading reference directory {}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("listing {}", dir.display()))?;
        files.retain(|p| p.is_file());
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut records = Vec::with_capacity(files.len());
        for path in &files {
            let Some(label) = identity::label_for(path, style) else {
                continue;
            };
            let img = match image::open(path) {
                Ok(img) => DynamicImage::ImageRgb8(img.to_rgb8()),
                Err(e) => {
                    warn!("Skipping {}: not a readable image ({})", path.display(), e);
                    continue;
                }
            };
            let faces = extractor
                .extract(&img)
                .with_context(|| format!("extracting faces from {}", path.display()))?;
            let found = faces.len();
            match selection.select(faces) {
                Some(face) => {
                    debug!("{}: {} face(s), using one as {}", path.display(), found, label);
                    records.push(ReferenceRecord {
                        label,
                        embedding: face.embedding,
                    });
                }
                None => warn!("Skipping {}: no face detected", path.display()),
            }
        }

        let db = Self::from_records(records)?;
        info!(
            "Reference database: {} record(s) from {} file(s) in {}",
            db.len(),
            files.len(),
            dir.display()
        );
        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Embedding dimensionality; 0 for an empty database.
    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn label(&self, row: usize) -> Option<&str> {
        self.labels.get(row).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn embeddings(&self) -> ArrayView2<'_, f32> {
        self.embeddings.view()
    }

    pub fn embedding(&self, row: usize) -> Option<ArrayView1<'_, f32>> {
        (row < self.len()).then(|| self.embeddings.row(row))
    }
}
