//! Exact nearest-neighbor search by squared Euclidean distance.
//!
//! For unit-length embeddings `|a - b|^2 = 2 - 2cos(a, b)`, so the ranking matches cosine
//! similarity while the distance stays on the scale the match threshold is expressed in.

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vidface_vision::face::squared_l2;

use crate::storage;

const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub distance: f32,
    pub row: usize,
}

/// Brute-force index over an N×D matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    vectors: Array2<f32>,
}

#[derive(Serialize, Deserialize)]
struct IndexBlob {
    version: u8,
    dim: u64,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Index every row of `matrix`. Row numbers of search results refer to `matrix` rows.
    pub fn build(matrix: ArrayView2<'_, f32>) -> Self {
        Self {
            vectors: matrix.to_owned(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    /// The `k` nearest rows, ascending by distance; ties go to the lower row.
    ///
    /// An empty index returns no neighbors for any query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dim() {
            anyhow::bail!(
                "query has dimension {}, index has {}",
                query.len(),
                self.dim()
            );
        }

        if self.dim() == 0 {
            anyhow::bail!("index rows have no dimensions");
        }

        let matrix = self.vectors.as_standard_layout();
        let data = matrix
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("index matrix is not contiguous"))?;
        let mut hits: Vec<Neighbor> = data
            .chunks_exact(self.dim())
            .enumerate()
            .map(|(row, v)| Neighbor {
                distance: squared_l2(v, query),
                row,
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn nearest(&self, query: &[f32]) -> Result<Option<Neighbor>> {
        Ok(self.search(query, 1)?.into_iter().next())
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let blob = IndexBlob {
            version: FORMAT_VERSION,
            dim: self.dim() as u64,
            data: self.vectors.iter().copied().collect(),
        };
        storage::write_blob(path, &blob)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let blob: IndexBlob = storage::read_blob(path)?;
        if blob.version != FORMAT_VERSION {
            anyhow::bail!(
                "{} has index format {}, expected {}",
                path.display(),
                blob.version,
                FORMAT_VERSION
            );
        }
        let dim = blob.dim as usize;
        let rows = match dim {
            0 if blob.data.is_empty() => 0,
            0 => anyhow::bail!("{} is corrupt: data without dimension", path.display()),
            _ if blob.data.len() % dim != 0 => {
                anyhow::bail!("{} is corrupt: ragged matrix", path.display())
            }
            _ => blob.data.len() / dim,
        };
        let vectors = Array2::from_shape_vec((rows, dim), blob.data)
            .with_context(|| format!("reshaping {}", path.display()))?;
        Ok(Self { vectors })
    }
}
