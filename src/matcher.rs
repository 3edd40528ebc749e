//! Verification engine.
//!
//! Each request runs a fresh state machine:
//!
//! ```text
//! Pending → Sampling → Extracting → Matching → Resolved(Found | NotFound)
//!               └──────────────────────────────→ Resolved(InsufficientFrames)
//! ```
//!
//! Candidates are every face of every sampled frame, in extraction order. The first candidate
//! whose nearest reference lies strictly closer than the threshold decides the request; later
//! candidates are never looked at, even if they would match better.

use anyhow::Result;
use image::{DynamicImage, RgbImage};
use log::{debug, info};
use std::path::Path;
use std::time::{Duration, Instant};
use vidface_vision::{Embedding, EmbeddingExtractor, FrameSource, VideoDecoder};

use crate::config::{Config, DEFAULT_SAMPLE_COUNT, DEFAULT_THRESHOLD};
use crate::context::ReferenceSet;
use crate::error::VerifyError;
use crate::sampler::{self, FramePicker};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchSettings {
    pub threshold: f32,
    pub sample_count: usize,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            sample_count: DEFAULT_SAMPLE_COUNT,
        }
    }
}

impl From<&Config> for MatchSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            threshold: cfg.threshold,
            sample_count: cfg.sample_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub label: String,
    pub distance: f32,
    pub row: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Found(Match),
    NotFound,
    /// The video had fewer frames than the sampler needs.
    InsufficientFrames,
}

/// Strict comparison: a distance equal to the threshold is not a match.
pub fn is_match(distance: f32, threshold: f32) -> bool {
    distance < threshold
}

enum State {
    Pending,
    Sampling,
    Extracting(Vec<RgbImage>),
    Matching(Vec<Embedding>),
    Resolved(Outcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Sampling => "sampling",
            State::Extracting(_) => "extracting",
            State::Matching(_) => "matching",
            State::Resolved(_) => "resolved",
        }
    }
}

/// Frame source that refuses to decode once the deadline has passed.
struct Bounded<'s> {
    inner: &'s mut dyn FrameSource,
    deadline: Instant,
}

impl FrameSource for Bounded<'_> {
    fn frame_count(&self) -> usize {
        self.inner.frame_count()
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if Instant::now() >= self.deadline {
            anyhow::bail!("deadline passed");
        }
        self.inner.next_frame()
    }
}

pub struct Verifier<'a> {
    references: &'a ReferenceSet,
    settings: MatchSettings,
    deadline: Option<(Instant, Duration)>,
}

impl<'a> Verifier<'a> {
    pub fn new(references: &'a ReferenceSet, settings: MatchSettings) -> Self {
        Self {
            references,
            settings,
            deadline: None,
        }
    }

    /// Give up with [`VerifyError::Timeout`] once `timeout` has elapsed from now.
    ///
    /// The deadline is checked between decoded frames and between extractor calls, so a
    /// single slow frame or extraction can overrun it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    fn check_deadline(&self) -> Result<(), VerifyError> {
        match self.deadline {
            Some((deadline, timeout)) if Instant::now() >= deadline => {
                Err(VerifyError::Timeout(timeout))
            }
            _ => Ok(()),
        }
    }

    /// Open `path` with `decoder` and verify it.
    pub fn verify_path(
        &self,
        path: &Path,
        decoder: &dyn VideoDecoder,
        extractor: &mut dyn EmbeddingExtractor,
        picker: &mut dyn FramePicker,
    ) -> Result<Outcome, VerifyError> {
        let mut source = decoder.open(path).map_err(|reason| VerifyError::OpenVideo {
            path: path.to_path_buf(),
            reason,
        })?;
        let outcome = self.verify(source.as_mut(), extractor, picker)?;
        info!("{}: {:?}", path.display(), outcome);
        Ok(outcome)
    }

    pub fn verify(
        &self,
        source: &mut dyn FrameSource,
        extractor: &mut dyn EmbeddingExtractor,
        picker: &mut dyn FramePicker,
    ) -> Result<Outcome, VerifyError> {
        match self.deadline {
            Some((deadline, _)) => self.run(
                &mut Bounded {
                    inner: source,
                    deadline,
                },
                extractor,
                picker,
            ),
            None => self.run(source, extractor, picker),
        }
    }

    fn run(
        &self,
        source: &mut dyn FrameSource,
        extractor: &mut dyn EmbeddingExtractor,
        picker: &mut dyn FramePicker,
    ) -> Result<Outcome, VerifyError> {
        let mut state = State::Pending;
        loop {
            debug!("verification stage: {}", state.name());
            state = match state {
                State::Pending => State::Sampling,
                State::Sampling => {
                    let frames = sampler::sample_frames(source, self.settings.sample_count, picker);
                    self.check_deadline()?;
                    if frames.is_empty() {
                        State::Resolved(Outcome::InsufficientFrames)
                    } else {
                        State::Extracting(frames)
                    }
                }
                State::Extracting(frames) => State::Matching(self.candidates(frames, extractor)?),
                State::Matching(candidates) => State::Resolved(self.first_match(&candidates)?),
                State::Resolved(outcome) => return Ok(outcome),
            };
        }
    }

    /// First candidate under the threshold, in order; `NotFound` if none.
    pub fn first_match(&self, candidates: &[Embedding]) -> Result<Outcome, VerifyError> {
        for (i, candidate) in candidates.iter().enumerate() {
            let nearest = self
                .references
                .index()
                .nearest(candidate.as_slice())
                .map_err(VerifyError::Search)?;
            let Some(hit) = nearest else {
                debug!("candidate {}: reference set is empty", i);
                continue;
            };
            debug!(
                "candidate {}: nearest row {} at {:.4} (threshold {})",
                i, hit.row, hit.distance, self.settings.threshold
            );
            if is_match(hit.distance, self.settings.threshold) {
                let label = self.references.database().label(hit.row).ok_or_else(|| {
                    VerifyError::Internal(format!("index row {} has no label", hit.row))
                })?;
                return Ok(Outcome::Found(Match {
                    label: label.to_string(),
                    distance: hit.distance,
                    row: hit.row,
                }));
            }
        }
        Ok(Outcome::NotFound)
    }

    /// All face embeddings of all frames; a frame without faces contributes nothing.
    fn candidates(
        &self,
        frames: Vec<RgbImage>,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<Vec<Embedding>, VerifyError> {
        let mut out = Vec::new();
        for (i, frame) in frames.into_iter().enumerate() {
            self.check_deadline()?;
            let faces = extractor
                .extract(&DynamicImage::ImageRgb8(frame))
                .map_err(VerifyError::Extraction)?;
            debug!("sampled frame {}: {} face(s)", i, faces.len());
            out.extend(faces.into_iter().map(|f| f.embedding));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ReferenceDatabase, ReferenceRecord};

    fn unit(angle: f32) -> Embedding {
        Embedding::from_unit(vec![angle.cos(), angle.sin()])
    }

    fn references(entries: &[(&str, f32)]) -> ReferenceSet {
        let records = entries
            .iter()
            .map(|(label, angle)| ReferenceRecord {
                label: label.to_string(),
                embedding: unit(*angle),
            })
            .collect();
        ReferenceSet::new(ReferenceDatabase::from_records(records).unwrap())
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!is_match(0.6, 0.6));
        assert!(is_match(0.6 - 1e-6, 0.6));
        assert!(!is_match(f32::NAN, 0.6));
    }

    #[test]
    fn distance_equal_to_threshold_is_not_found() {
        let refs = references(&[("alice.jpg", 0.0)]);
        let query = unit(0.5);
        let d = refs.index().nearest(query.as_slice()).unwrap().unwrap().distance;

        let at = Verifier::new(&refs, MatchSettings { threshold: d, ..Default::default() });
        assert_eq!(at.first_match(&[query.clone()]).unwrap(), Outcome::NotFound);

        let above = MatchSettings {
            threshold: d + 1e-4,
            ..Default::default()
        };
        match Verifier::new(&refs, above).first_match(&[query]).unwrap() {
            Outcome::Found(m) => assert_eq!(m.label, "alice.jpg"),
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn first_candidate_under_threshold_wins() {
        let refs = references(&[("alice.jpg", 0.0), ("bob.jpg", 1.5)]);
        let verifier = Verifier::new(&refs, MatchSettings::default());

        // a loose bob match comes before an exact alice match
        let candidates = [unit(3.0), unit(1.2), unit(0.0)];
        match verifier.first_match(&candidates).unwrap() {
            Outcome::Found(m) => {
                assert_eq!(m.label, "bob.jpg");
                assert_eq!(m.row, 1);
                assert!(m.distance > 0.0);
            }
            other => panic!("expected bob, got {:?}", other),
        }
    }

    #[test]
    fn empty_reference_set_never_matches() {
        let refs = ReferenceSet::new(ReferenceDatabase::empty());
        let verifier = Verifier::new(&refs, MatchSettings::default());
        assert_eq!(
            verifier.first_match(&[unit(0.0), unit(1.0)]).unwrap(),
            Outcome::NotFound
        );
    }

    #[test]
    fn no_candidates_is_not_found() {
        let refs = references(&[("alice.jpg", 0.0)]);
        let verifier = Verifier::new(&refs, MatchSettings::default());
        assert_eq!(verifier.first_match(&[]).unwrap(), Outcome::NotFound);
    }

    #[test]
    fn wrong_dimension_is_a_search_error() {
        let refs = references(&[("alice.jpg", 0.0)]);
        let verifier = Verifier::new(&refs, MatchSettings::default());
        let odd = Embedding::from_unit(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            verifier.first_match(&[odd]),
            Err(VerifyError::Search(_))
        ));
    }
}
