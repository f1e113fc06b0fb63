//! The Embedder capability: one face image in, one embedding out.
//!
//! Two variants are selected by configuration at startup:
//! - [`OnnxEmbedder`]: SCRFD detection, largest-face selection, ArcFace.
//! - [`CenterCropEmbedder`]: a deterministic fallback that needs no model
//!   files. Its output is always flagged [`FaceQuality::CenterCrop`].
//!
//! [`LazyEmbedder`] defers loading until the first call and is meant to be
//! owned by the service and shared by `Arc`.

use crate::detector::{self, DetectorError, FaceDetector};
use crate::image::{FaceImage, ImageError};
use crate::recognizer::{self, FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

const CENTER_CROP_SIZE: u32 = 64;
pub const CENTER_CROP_MODEL_VERSION: &str = "center-crop-64";

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("unreadable image: {0}")]
    UnreadableImage(#[from] ImageError),
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("embedding inference failed: {0}")]
    Inference(String),
    #[error("malformed embedding: {0}")]
    MalformedEmbedding(String),
}

impl From<DetectorError> for EmbeddingError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => EmbeddingError::ModelUnavailable(path),
            other => EmbeddingError::Inference(other.to_string()),
        }
    }
}

impl From<RecognizerError> for EmbeddingError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => EmbeddingError::ModelUnavailable(path),
            other => EmbeddingError::Inference(other.to_string()),
        }
    }
}

/// How the face region behind an embedding was located.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FaceQuality {
    /// A detector found the face; `faces` is how many were in the frame.
    Detected { confidence: f32, faces: usize },
    /// No detector was available; the center of the image was used.
    CenterCrop,
}

impl FaceQuality {
    pub fn is_degraded(&self) -> bool {
        matches!(self, FaceQuality::CenterCrop)
    }
}

/// An embedding plus the quality flag of the crop it was computed from.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub embedding: Embedding,
    pub quality: FaceQuality,
}

/// Maps a decoded face image to a fixed-length embedding.
///
/// Implementations are deterministic for a fixed image and model version.
pub trait Embedder: Send + Sync {
    fn model_version(&self) -> &str;

    fn embed(&self, image: &FaceImage) -> Result<Extraction, EmbeddingError>;

    /// Decode an encoded image and embed it.
    fn embed_bytes(&self, bytes: &[u8]) -> Result<Extraction, EmbeddingError> {
        let image = FaceImage::decode(bytes)?;
        self.embed(&image)
    }
}

/// SCRFD + ArcFace embedder.
///
/// ONNX sessions need exclusive access while running, so each model sits
/// behind its own mutex.
pub struct OnnxEmbedder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EmbeddingError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn model_version(&self) -> &str {
        recognizer::ARCFACE_MODEL_VERSION
    }

    fn embed(&self, image: &FaceImage) -> Result<Extraction, EmbeddingError> {
        let faces = self
            .detector
            .lock()
            .map_err(|_| EmbeddingError::ModelUnavailable("detector lock poisoned".into()))?
            .detect(image)?;

        let face = detector::select_largest_face(&faces).ok_or(EmbeddingError::NoFaceDetected)?;
        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            area = face.area(),
            "embed: subject face selected"
        );

        let embedding = self
            .recognizer
            .lock()
            .map_err(|_| EmbeddingError::ModelUnavailable("recognizer lock poisoned".into()))?
            .extract(image, face)?;

        Ok(Extraction {
            embedding,
            quality: FaceQuality::Detected {
                confidence: face.confidence,
                faces: faces.len(),
            },
        })
    }
}

/// Deterministic fallback: a zero-mean, unit-length vector of the pixels in
/// the central square of the image (half the shorter side), resampled to
/// 64×64.
///
/// Centering makes the score a pixel correlation, so unrelated images land
/// near 0.0 instead of sharing a large positive brightness component.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterCropEmbedder;

impl CenterCropEmbedder {
    fn center_crop(image: &FaceImage) -> FaceImage {
        let side = (image.width.min(image.height) / 2).max(1);
        let x = (image.width - side) / 2;
        let y = (image.height - side) / 2;
        image
            .crop(x, y, side, side)
            .resize(CENTER_CROP_SIZE, CENTER_CROP_SIZE)
    }
}

impl Embedder for CenterCropEmbedder {
    fn model_version(&self) -> &str {
        CENTER_CROP_MODEL_VERSION
    }

    fn embed(&self, image: &FaceImage) -> Result<Extraction, EmbeddingError> {
        let crop = Self::center_crop(image);
        let pixels: Vec<f32> = crop.data.iter().map(|&p| p as f32 / 255.0).collect();
        let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
        let centered: Vec<f32> = pixels.iter().map(|p| p - mean).collect();

        let values = recognizer::l2_normalize(&centered);
        Ok(Extraction {
            embedding: Embedding::new(values, CENTER_CROP_MODEL_VERSION),
            quality: FaceQuality::CenterCrop,
        })
    }
}

/// Which embedder variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Onnx,
    CenterCrop,
}

impl EmbedderKind {
    pub fn model_version(&self) -> &'static str {
        match self {
            EmbedderKind::Onnx => recognizer::ARCFACE_MODEL_VERSION,
            EmbedderKind::CenterCrop => CENTER_CROP_MODEL_VERSION,
        }
    }
}

impl FromStr for EmbedderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" | "arcface" => Ok(EmbedderKind::Onnx),
            "center-crop" | "center_crop" | "fallback" => Ok(EmbedderKind::CenterCrop),
            other => Err(format!("unknown embedder '{other}' (expected onnx or center-crop)")),
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmbedderKind::Onnx => "onnx",
            EmbedderKind::CenterCrop => "center-crop",
        })
    }
}

/// Embedder that loads its variant on first use.
pub struct LazyEmbedder {
    kind: EmbedderKind,
    model_dir: PathBuf,
    slot: OnceLock<Box<dyn Embedder>>,
    init: Mutex<()>,
}

impl LazyEmbedder {
    pub fn new(kind: EmbedderKind, model_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            model_dir: model_dir.into(),
            slot: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> EmbedderKind {
        self.kind
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Load now instead of on the first embed call.
    pub fn preload(&self) -> Result<(), EmbeddingError> {
        self.get().map(|_| ())
    }

    fn get(&self) -> Result<&dyn Embedder, EmbeddingError> {
        if let Some(loaded) = self.slot.get() {
            return Ok(loaded.as_ref());
        }

        let _guard = self
            .init
            .lock()
            .map_err(|_| EmbeddingError::ModelUnavailable("embedder init lock poisoned".into()))?;
        if self.slot.get().is_none() {
            let loaded: Box<dyn Embedder> = match self.kind {
                EmbedderKind::Onnx => Box::new(OnnxEmbedder::load(&self.model_dir)?),
                EmbedderKind::CenterCrop => Box::new(CenterCropEmbedder),
            };
            tracing::info!(kind = %self.kind, version = loaded.model_version(), "embedder loaded");
            let _ = self.slot.set(loaded);
        }

        self.slot
            .get()
            .map(|loaded| loaded.as_ref())
            .ok_or_else(|| EmbeddingError::ModelUnavailable("embedder failed to initialise".into()))
    }
}

impl Embedder for LazyEmbedder {
    fn model_version(&self) -> &str {
        self.kind.model_version()
    }

    fn embed(&self, image: &FaceImage) -> Result<Extraction, EmbeddingError> {
        self.get()?.embed(image)
    }
}
