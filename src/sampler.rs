//! Frame sampling.
//!
//! A handful of distinct frame positions is drawn at random and only those frames are decoded.
//! Because the draw is random, verifying the same video twice may look at different frames and
//! reach different outcomes. Tests pin the draw with [`RandomPicker::seeded`] or
//! [`FixedPicker`].

use image::RgbImage;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use vidface_vision::FrameSource;

/// Chooses which frame positions to decode.
pub trait FramePicker {
    /// `count` distinct indices in `0..total`. Only called with `total >= count`.
    fn pick(&mut self, total: usize, count: usize) -> Vec<usize>;
}

/// Uniform sampling without replacement.
pub struct RandomPicker<R = StdRng> {
    rng: R,
}

impl RandomPicker<StdRng> {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> RandomPicker<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: Rng> FramePicker for RandomPicker<R> {
    fn pick(&mut self, total: usize, count: usize) -> Vec<usize> {
        rand::seq::index::sample(&mut self.rng, total, count.min(total)).into_vec()
    }
}

/// A predetermined list of positions; out-of-range and repeated entries are ignored.
#[derive(Debug, Clone)]
pub struct FixedPicker(pub Vec<usize>);

impl FramePicker for FixedPicker {
    fn pick(&mut self, total: usize, count: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        self.0
            .iter()
            .copied()
            .filter(|&i| i < total && seen.insert(i))
            .take(count)
            .collect()
    }
}

/// Decode the frames at `count` picked positions of `source`.
///
/// Returns nothing when the video advertises fewer than `count` frames. Frames are read
/// sequentially from the start and reading stops once every picked frame is collected. A
/// decode error or premature end of stream truncates the result instead of failing.
pub fn sample_frames(
    source: &mut dyn FrameSource,
    count: usize,
    picker: &mut dyn FramePicker,
) -> Vec<RgbImage> {
    let total = source.frame_count();
    if count == 0 || total < count {
        debug!("video has {} frame(s), {} needed", total, count);
        return Vec::new();
    }

    let wanted: BTreeSet<usize> = picker.pick(total, count).into_iter().collect();
    debug!("sampling frames {:?} of {}", wanted, total);
    let Some(&last) = wanted.iter().next_back() else {
        return Vec::new();
    };

    let mut frames = Vec::with_capacity(wanted.len());
    for position in 0..=last {
        match source.next_frame() {
            Ok(Some(frame)) => {
                if wanted.contains(&position) {
                    frames.push(frame);
                }
            }
            Ok(None) => {
                warn!(
                    "stream ended at frame {} of {} advertised; kept {} frame(s)",
                    position,
                    total,
                    frames.len()
                );
                break;
            }
            Err(e) => {
                warn!(
                    "decode failed at frame {}: {:#}; kept {} frame(s)",
                    position,
                    e,
                    frames.len()
                );
                break;
            }
        }
    }
    frames
}
