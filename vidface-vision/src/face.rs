use crate::yunet;
use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

/// YuNet's fixed square input.
const DETECTOR_INPUT: u32 = 640;
/// SFace's aligned crop size.
pub const FACE_SIZE: u32 = 112;

/// A face box reported by the detector, in source image pixels.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,x2,y2,...,x5,y5
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.bbox[2].max(0.0) * self.bbox[3].max(0.0)
    }
}

/// Unit-length face embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    /// L2-normalizes `raw`. A zero vector is kept as is.
    pub fn normalized(raw: Vec<f32>) -> Self {
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let vector = if norm > 0.0 {
            raw.into_iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self {
            vector: Array1::from_vec(vector),
        }
    }

    /// Wraps a vector that is already normalized.
    pub fn from_unit(vector: Vec<f32>) -> Self {
        Self {
            vector: Array1::from_vec(vector),
        }
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        self.vector.as_slice().unwrap_or_default()
    }
}

/// One detected face together with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub detection: Detection,
    pub embedding: Embedding,
}

/// Image in, zero or more faces out.
///
/// Implementations must return an empty list when no face is present; `Err` is reserved for
/// genuine failures (model errors, malformed tensors).
pub trait EmbeddingExtractor {
    fn extract(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        (**self).extract(img)
    }
}

/// Squared Euclidean distance.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Letterbox placement of a source image inside the detector canvas.
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
}

impl Letterbox {
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let size = DETECTOR_INPUT as f32;
        (
            (x * size - self.offset_x) / self.scale,
            (y * size - self.offset_y) / self.scale,
        )
    }
}

/// Pads `img` to a square, resizes to 640x640 and lays it out as a BGR CHW tensor.
fn detector_input(img: &DynamicImage) -> Result<(Array4<f32>, Letterbox)> {
    let (width, height) = img.dimensions();
    let scale = DETECTOR_INPUT as f32 / width.max(height) as f32;
    let new_w = ((width as f32 * scale) as u32).max(1);
    let new_h = ((height as f32 * scale) as u32).max(1);
    let resized = img.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);

    let mut canvas = DynamicImage::new_rgb8(DETECTOR_INPUT, DETECTOR_INPUT);
    let offset_x = (DETECTOR_INPUT - new_w) / 2;
    let offset_y = (DETECTOR_INPUT - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    let tensor = bgr_chw(&canvas.to_rgb8())?;
    Ok((
        tensor,
        Letterbox {
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        },
    ))
}

/// RGB HWC bytes to a `[1, 3, H, W]` BGR tensor with values in [0, 255].
fn bgr_chw(rgb: &RgbImage) -> Result<Array4<f32>> {
    let (w, h) = rgb.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (i, px) in rgb.pixels().enumerate() {
        data[i] = px[2] as f32;
        data[plane + i] = px[1] as f32;
        data[2 * plane + i] = px[0] as f32;
    }
    Ok(Array4::from_shape_vec((1, 3, h as usize, w as usize), data)?)
}

/// Run YuNet over `img` and return NMS-filtered detections ordered by score.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let (input, letterbox) = detector_input(img)?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;

    let mut tensors: Vec<(Vec<i64>, Vec<f32>)> = Vec::with_capacity(12);
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        tensors.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let heads = yunet::Heads::parse(&tensors, DETECTOR_INPUT as usize)
        .context("unexpected detector outputs")?;

    let detections: Vec<Detection> = heads
        .decode(score_threshold)
        .into_iter()
        .map(|raw| {
            let (x, y) = letterbox.to_source(raw.bbox[0], raw.bbox[1]);
            let size = DETECTOR_INPUT as f32 / letterbox.scale;
            let mut landmarks = [0.0f32; 10];
            for k in 0..5 {
                let (lx, ly) = letterbox.to_source(raw.landmarks[k * 2], raw.landmarks[k * 2 + 1]);
                landmarks[k * 2] = lx;
                landmarks[k * 2 + 1] = ly;
            }
            Detection {
                bbox: [x, y, raw.bbox[2] * size, raw.bbox[3] * size],
                score: raw.score,
                landmarks,
            }
        })
        .collect();

    Ok(nms(&detections, nms_threshold))
}

/// Greedy non-maximum suppression; output is sorted by descending score.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in sorted {
        if keep
            .iter()
            .all(|kept| compute_iou(&kept.bbox, &candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Rotate, scale and translate the face so the eyes land on the ArcFace reference points.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<RgbImage> {
    const LEFT_EYE: (f32, f32) = (38.2946, 51.6963);
    const RIGHT_EYE: (f32, f32) = (73.5318, 51.5014);

    let unit = size as f32 / FACE_SIZE as f32;
    let (lx, ly) = (detection.landmarks[0], detection.landmarks[1]);
    let (rx, ry) = (detection.landmarks[2], detection.landmarks[3]);
    let (dx, dy) = (rx - lx, ry - ly);
    let eye_dist = (dx * dx + dy * dy).sqrt();
    if eye_dist <= f32::EPSILON {
        anyhow::bail!("degenerate landmarks: eyes coincide");
    }

    let ref_dist = ((RIGHT_EYE.0 - LEFT_EYE.0).powi(2) + (RIGHT_EYE.1 - LEFT_EYE.1).powi(2)).sqrt();
    let scale = unit * ref_dist / eye_dist;
    let angle = dy.atan2(dx);
    let (sin, cos) = angle.sin_cos();

    // forward map: out = M * src + t, M = scale * R(-angle)
    let (a, b, c, d) = (scale * cos, scale * sin, -scale * sin, scale * cos);
    let center = ((lx + rx) / 2.0, (ly + ry) / 2.0);
    let target = (
        (LEFT_EYE.0 + RIGHT_EYE.0) / 2.0 * unit,
        (LEFT_EYE.1 + RIGHT_EYE.1) / 2.0 * unit,
    );
    let tx = target.0 - (a * center.0 + b * center.1);
    let ty = target.1 - (c * center.0 + d * center.1);
    let det = a * d - b * c;

    let src = img.to_rgb8();
    let (w, h) = src.dimensions();
    let mut out = RgbImage::new(size, size);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        let (u, v) = (ox as f32 - tx, oy as f32 - ty);
        let sx = (d * u - b * v) / det;
        let sy = (-c * u + a * v) / det;
        if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
            continue;
        }
        *px = bilinear(&src, sx, sy);
    }
    Ok(out)
}

fn bilinear(src: &RgbImage, x: f32, y: f32) -> image::Rgb<u8> {
    let (w, h) = src.dimensions();
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let weights = [
        ((x0, y0), (1.0 - fx) * (1.0 - fy)),
        ((x1, y0), fx * (1.0 - fy)),
        ((x0, y1), (1.0 - fx) * fy),
        ((x1, y1), fx * fy),
    ];
    let mut acc = [0.0f32; 3];
    for ((px, py), weight) in weights {
        let p = src.get_pixel(px, py);
        for ch in 0..3 {
            acc[ch] += p[ch] as f32 * weight;
        }
    }
    image::Rgb([acc[0] as u8, acc[1] as u8, acc[2] as u8])
}

/// Run SFace over an aligned crop and L2-normalize the result.
pub fn encode_face(session: &mut Session, face: &RgbImage) -> Result<Embedding> {
    let crop = if face.dimensions() == (FACE_SIZE, FACE_SIZE) {
        face.clone()
    } else {
        image::imageops::resize(
            face,
            FACE_SIZE,
            FACE_SIZE,
            image::imageops::FilterType::Triangle,
        )
    };
    let input = bgr_chw(&crop)?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let dim = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if dim == 0 || dim > data.len() {
        anyhow::bail!("recognizer returned an empty embedding (shape {:?})", shape);
    }
    Ok(Embedding::normalized(data[..dim].to_vec()))
}
