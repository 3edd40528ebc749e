//! YuNet detector post-processing.
//!
//! YuNet is anchor-free: every cell of the stride-8, 16 and 32 feature grids predicts a
//! classification score, an objectness score, a box and five landmarks. The model emits twelve
//! tensors in the order `cls_8, cls_16, cls_32, obj_8, obj_16, obj_32, bbox_8, bbox_16,
//! bbox_32, kps_8, kps_16, kps_32`, each shaped `[1, H*W, C]`.
//!
//! Decoding for a cell at grid position (col, row) with stride `s`:
//! ```text
//! score = sqrt(clamp(cls) * clamp(obj))
//! cx    = (col + dx) * s          w = exp(dw) * s
//! cy    = (row + dy) * s          h = exp(dh) * s
//! kp_k  = ((col + kx_k) * s, (row + ky_k) * s)
//! ```
//! All coordinates are returned normalized to the square input.

use anyhow::Result;
use ndarray::{Array2, ArrayView2, Zip};

const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // normalized [0,1]
}

/// Per-stride prediction heads.
pub struct Heads {
    input_size: usize,
    scores: Vec<Array2<f32>>,
    boxes: Vec<Array2<f32>>,
    keypoints: Vec<Array2<f32>>,
}

impl Heads {
    /// Validate and split the detector's raw outputs.
    pub fn parse(outputs: &[(Vec<i64>, Vec<f32>)], input_size: usize) -> Result<Self> {
        if outputs.len() < 12 {
            anyhow::bail!("expected 12 detector outputs, got {}", outputs.len());
        }

        let head = |slot: usize, stride_idx: usize, channels: usize| -> Result<Array2<f32>> {
            let cells = (input_size / STRIDES[stride_idx]).pow(2);
            let (shape, data) = &outputs[slot];
            if shape[..] != [1, cells as i64, channels as i64] {
                anyhow::bail!(
                    "output {} has shape {:?}, expected [1, {}, {}]",
                    slot,
                    shape,
                    cells,
                    channels
                );
            }
            Ok(Array2::from_shape_vec((cells, channels), data.clone())?)
        };

        let mut scores = Vec::with_capacity(3);
        let mut boxes = Vec::with_capacity(3);
        let mut keypoints = Vec::with_capacity(3);
        for s in 0..STRIDES.len() {
            let cls = head(s, s, 1)?;
            let obj = head(s + 3, s, 1)?;
            scores.push(combine_scores(cls.view(), obj.view()));
            boxes.push(head(s + 6, s, 4)?);
            keypoints.push(head(s + 9, s, 10)?);
        }

        Ok(Self {
            input_size,
            scores,
            boxes,
            keypoints,
        })
    }

    #[cfg(test)]
    fn from_parts(
        input_size: usize,
        scores: Vec<Array2<f32>>,
        boxes: Vec<Array2<f32>>,
        keypoints: Vec<Array2<f32>>,
    ) -> Self {
        Self {
            input_size,
            scores,
            boxes,
            keypoints,
        }
    }

    /// Every cell whose score reaches `score_threshold`, before NMS.
    pub fn decode(&self, score_threshold: f32) -> Vec<RawDetection> {
        let size = self.input_size as f32;
        let mut out = Vec::new();

        for (s, &stride) in STRIDES.iter().enumerate() {
            let cols = self.input_size / stride;
            let stride = stride as f32;
            for (idx, score) in self.scores[s].column(0).iter().copied().enumerate() {
                if score < score_threshold {
                    continue;
                }
                let (col, row) = ((idx % cols) as f32, (idx / cols) as f32);
                let b = self.boxes[s].row(idx);
                let w = b[2].exp() * stride;
                let h = b[3].exp() * stride;
                let cx = (col + b[0]) * stride;
                let cy = (row + b[1]) * stride;

                let kp = self.keypoints[s].row(idx);
                let mut landmarks = [0.0f32; 10];
                for k in 0..5 {
                    landmarks[k * 2] = (col + kp[k * 2]) * stride / size;
                    landmarks[k * 2 + 1] = (row + kp[k * 2 + 1]) * stride / size;
                }

                out.push(RawDetection {
                    bbox: [(cx - w / 2.0) / size, (cy - h / 2.0) / size, w / size, h / size],
                    score,
                    landmarks,
                });
            }
        }
        out
    }
}

fn combine_scores(cls: ArrayView2<f32>, obj: ArrayView2<f32>) -> Array2<f32> {
    Zip::from(&cls)
        .and(&obj)
        .map_collect(|&c, &o| (c.clamp(0.0, 1.0) * o.clamp(0.0, 1.0)).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_heads(input_size: usize) -> (Vec<Array2<f32>>, Vec<Array2<f32>>, Vec<Array2<f32>>) {
        let mut scores = Vec::new();
        let mut boxes = Vec::new();
        let mut kps = Vec::new();
        for stride in STRIDES {
            let cells = (input_size / stride).pow(2);
            scores.push(Array2::zeros((cells, 1)));
            boxes.push(Array2::zeros((cells, 4)));
            kps.push(Array2::zeros((cells, 10)));
        }
        (scores, boxes, kps)
    }

    #[test]
    fn decodes_single_cell_on_coarse_grid() {
        let input_size = 640;
        let (mut scores, mut boxes, mut kps) = empty_heads(input_size);

        // stride 32, grid 20x20, cell (row 10, col 10)
        let idx = 10 * 20 + 10;
        scores[2][[idx, 0]] = 0.9;
        boxes[2][[idx, 0]] = 0.5;
        boxes[2][[idx, 1]] = 0.3;
        boxes[2][[idx, 2]] = 4.0f32.ln();
        boxes[2][[idx, 3]] = 4.0f32.ln();
        kps[2][[idx, 0]] = 0.0;
        kps[2][[idx, 1]] = 0.0;

        let heads = Heads::from_parts(input_size, scores, boxes, kps);
        let dets = heads.decode(0.5);
        assert_eq!(dets.len(), 1);
        let det = &dets[0];

        // cx = 10.5 * 32 / 640 = 0.525, w = 4 * 32 / 640 = 0.2
        assert!((det.bbox[0] - 0.425).abs() < 1e-5);
        assert!((det.bbox[1] - 0.415).abs() < 1e-5);
        assert!((det.bbox[2] - 0.2).abs() < 1e-5);
        assert!((det.bbox[3] - 0.2).abs() < 1e-5);
        assert!((det.score - 0.9).abs() < 1e-6);
        assert!((det.landmarks[0] - 0.5).abs() < 1e-5);
        assert!((det.landmarks[1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn below_threshold_cells_are_dropped() {
        let (mut scores, boxes, kps) = empty_heads(640);
        scores[0][[5, 0]] = 0.4;
        let heads = Heads::from_parts(640, scores, boxes, kps);
        assert!(heads.decode(0.5).is_empty());
    }

    #[test]
    fn combined_score_is_geometric_mean() {
        let cls = Array2::from_shape_vec((2, 1), vec![0.81, 1.5]).unwrap();
        let obj = Array2::from_shape_vec((2, 1), vec![1.0, 0.25]).unwrap();
        let combined = combine_scores(cls.view(), obj.view());
        assert!((combined[[0, 0]] - 0.9).abs() < 1e-6);
        // cls clamps to 1.0
        assert!((combined[[1, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn parse_rejects_wrong_shapes() {
        let outputs = vec![(vec![1, 3, 1], vec![0.0; 3]); 12];
        assert!(Heads::parse(&outputs, 640).is_err());
        assert!(Heads::parse(&outputs[..4], 640).is_err());
    }
}
