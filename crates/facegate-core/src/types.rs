use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector, tagged with the model version that produced it.
///
/// Embeddings are immutable once produced; vectors from different model
/// versions are never compared with each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
    model_version: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Index of the first NaN or infinite component, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.values.iter().position(|v| !v.is_finite())
    }

    /// Non-empty with every component finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.first_non_finite().is_none()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]; 0.0 when either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Serialize the vector as a JSON array of floats.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.values)
    }

    /// Parse a vector previously written by [`to_json`](Self::to_json).
    pub fn from_json(
        json: &str,
        model_version: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let values: Vec<f32> = serde_json::from_str(json)?;
        Ok(Self::new(values, model_version))
    }
}

/// Cosine similarity `(a·b) / (‖a‖·‖b‖)`, defined as 0.0 for a zero-norm input.
///
/// Both slices must have the same length. Callers compare only vectors of
/// one dimension; the matcher skips gallery entries that differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "cosine similarity of unequal lengths");
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 && a == b {
        // Identical vectors score exactly 1.0 regardless of rounding.
        1.0
    } else if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Stable short code identifying an enrolled person (e.g. `"3FA9C1"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub const LEN: usize = 6;

    /// Six upper-case hex characters taken from a random v4 UUID.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..Self::LEN].to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an embedding came from the enrollment photo itself or from an
/// augmented copy of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Primary,
    Synthetic,
}

impl EmbeddingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingKind::Primary => "primary",
            EmbeddingKind::Synthetic => "synthetic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(EmbeddingKind::Primary),
            "synthetic" => Some(EmbeddingKind::Synthetic),
            _ => None,
        }
    }
}

/// One (identity, embedding) pair of a gallery snapshot.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub embedding: Embedding,
}

/// Summary row for an enrolled identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub label: Option<String>,
    pub primary: usize,
    pub synthetic: usize,
    pub created_at: Option<String>,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Best cosine similarity seen in the gallery, accepted or not (0.0 for an empty gallery).
    pub similarity: f32,
    /// Identity that produced the best score, set only when `matched`.
    pub identity: Option<IdentityId>,
    /// Number of gallery embeddings that were compared.
    pub compared: usize,
}

impl MatchResult {
    pub fn no_match(similarity: f32, compared: usize) -> Self {
        Self {
            matched: false,
            similarity,
            identity: None,
            compared,
        }
    }
}
