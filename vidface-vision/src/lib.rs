pub mod face;
pub mod model;
pub mod pipeline;
pub mod video;
pub mod yunet;

// Re-export commonly used types
pub use face::{DetectedFace, Detection, Embedding, EmbeddingExtractor};
pub use model::ModelConfig;
pub use pipeline::{Pipeline, SharedExtractor};
pub use video::{Ffmpeg, FrameSource, VideoDecoder};
