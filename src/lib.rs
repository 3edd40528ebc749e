pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod index;
pub mod matcher;
pub mod reference;
pub mod sampler;
pub mod server;
pub mod storage;

// Re-export vision types for convenience
pub use vidface_vision::{face, pipeline, video, DetectedFace, Embedding, EmbeddingExtractor, Pipeline};

pub use context::ReferenceSet;
pub use error::{Verdict, VerifyError};
pub use matcher::{MatchSettings, Outcome, Verifier};
