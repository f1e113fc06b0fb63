//! facegate-core: face enrollment and matching engine.
//!
//! One photo enrolls an identity: the photo is embedded, then augmented into
//! a handful of synthetic variants that are embedded too. Probes are matched
//! against every stored embedding by cosine similarity. Embeddings come from
//! SCRFD + ArcFace running on ONNX Runtime, or from a center-crop pixel
//! embedder when no models are installed.

pub mod alignment;
pub mod augment;
pub mod detector;
pub mod embedder;
pub mod enroll;
pub mod image;
pub mod matcher;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

pub use augment::{AugmentConfig, AugmentProfile, Augmenter};
pub use embedder::{
    CenterCropEmbedder, Embedder, EmbedderKind, EmbeddingError, Extraction, FaceQuality,
    LazyEmbedder, OnnxEmbedder,
};
pub use enroll::{CancelFlag, EnrollConfig, EnrollError, EnrollReport, EnrollmentState};
pub use crate::image::{FaceImage, ImageError};
pub use matcher::{CosineMatcher, MatchError, Matcher};
pub use service::{FaceService, ImageInput, RecognizeError, Recognition, ServiceStatus};
pub use store::{validate_embedding, IdentityStore, MemoryStore, StoreError};
pub use types::{
    BoundingBox, Embedding, EmbeddingKind, GalleryEntry, IdentityId, IdentitySummary, MatchResult,
};

use std::path::PathBuf;

/// Per-user data directory: `$XDG_DATA_HOME/facegate`, else `~/.local/share/facegate`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

/// Where the SCRFD and ArcFace ONNX files are looked up by default.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}
