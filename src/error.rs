use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::matcher::Outcome;

/// Failures of the collaborators around the decision logic.
///
/// None of these is a verification outcome: "no match" and "not enough frames" are
/// [`Outcome`] values.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("could not open video {}: {:#}", .path.display(), .reason)]
    OpenVideo { path: PathBuf, reason: anyhow::Error },

    #[error("face extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error("similarity search failed: {0:#}")]
    Search(anyhow::Error),

    #[error("could not store upload: {0:#}")]
    Upload(anyhow::Error),

    #[error("verification did not finish within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Internal(String),
}

impl VerifyError {
    /// Short description that is safe to show to clients; the `Display` text may carry paths
    /// and decoder output.
    pub fn category(&self) -> &'static str {
        match self {
            VerifyError::OpenVideo { .. } => "could not open video",
            VerifyError::Extraction(_) => "face extraction failed",
            VerifyError::Search(_) => "similarity search failed",
            VerifyError::Upload(_) => "could not store upload",
            VerifyError::Timeout(_) => "verification timed out",
            VerifyError::Internal(_) => "internal error",
        }
    }
}

/// What a caller is told about one verification request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Matched { identity: String },
    NotMatched,
    InsufficientFrames,
    Failed { reason: String },
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Matched { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Verdict::Matched { identity } => format!("Person Found: {}", identity),
            Verdict::NotMatched => "No matching person found in video".to_string(),
            Verdict::InsufficientFrames => "Not enough frames to analyze".to_string(),
            Verdict::Failed { reason } => format!("Processing error: {}", reason),
        }
    }
}

impl From<Outcome> for Verdict {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Found(m) => Verdict::Matched { identity: m.label },
            Outcome::NotFound => Verdict::NotMatched,
            Outcome::InsufficientFrames => Verdict::InsufficientFrames,
        }
    }
}

impl From<Result<Outcome, VerifyError>> for Verdict {
    fn from(result: Result<Outcome, VerifyError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(e) => Verdict::Failed {
                reason: e.category().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Match;

    #[test]
    fn three_user_visible_categories() {
        let found: Verdict = Ok(Outcome::Found(Match {
            label: "alice.jpg".into(),
            distance: 0.2,
            row: 0,
        }))
        .into();
        assert!(found.is_match());
        assert_eq!(found.message(), "Person Found: alice.jpg");

        let none: Verdict = Ok(Outcome::NotFound).into();
        assert_eq!(none, Verdict::NotMatched);
        assert_eq!(none.message(), "No matching person found in video");

        let short: Verdict = Ok(Outcome::InsufficientFrames).into();
        assert_ne!(short, none);
        assert_eq!(short.message(), "Not enough frames to analyze");

        let failed: Verdict = Err(VerifyError::Extraction(anyhow::anyhow!("model crashed"))).into();
        assert_eq!(
            failed,
            Verdict::Failed {
                reason: "face extraction failed".into()
            }
        );
        assert_eq!(failed.message(), "Processing error: face extraction failed");
    }

    #[test]
    fn open_errors_name_the_file() {
        let err = VerifyError::OpenVideo {
            path: PathBuf::from("videos/clip.mp4"),
            reason: anyhow::anyhow!("no video stream"),
        };
        assert_eq!(
            err.to_string(),
            "could not open video videos/clip.mp4: no video stream"
        );

        let verdict = Verdict::from(Err(err));
        assert!(!verdict.message().contains("clip.mp4"), "{}", verdict.message());
    }
}
