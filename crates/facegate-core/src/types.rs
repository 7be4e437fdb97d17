use serde::{Deserialize, Serialize};

/// Label reported when no gallery identity clears the threshold.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Prefix applied to a recognized identity that failed the liveness check.
pub const FAKE_PREFIX: &str = "FAKE: ";

/// Guards the cosine denominator against zero-norm vectors.
pub const SIMILARITY_EPSILON: f32 = 1e-10;

/// Face box in pixel coordinates as reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// Integer pixel rectangle inside an image (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Face embedding vector produced by the external embedding model.
///
/// The dimensionality is fixed per model (128 or 192 for the MobileFaceNet
/// family). An embedding is never empty once it has entered the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean (L2) norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Unit-length copy of this embedding. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|v| v / norm).collect())
        } else {
            self.clone()
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Compute `dot(a, b) / (||a|| * ||b|| + ε)`.
///
/// Always processes every dimension; vectors of unequal length are compared
/// over their common prefix, so callers must check dimensionality first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt() + SIMILARITY_EPSILON)
}

/// Build the composite gallery key `"{id_real}_{full_name}"`, with an
/// optional pose suffix (`"{id_real}_{full_name}_{pose}"`).
pub fn identity_key(id_real: &str, full_name: &str, pose: Option<&str>) -> String {
    match pose {
        Some(pose) => format!("{id_real}_{full_name}_{pose}"),
        None => format!("{id_real}_{full_name}"),
    }
}

/// Recover `id_real` from a composite key by splitting on the first `_`.
pub fn id_from_key(key: &str) -> &str {
    key.split_once('_').map(|(id, _)| id).unwrap_or(key)
}

/// One enrolled face variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id_real: String,
    pub full_name: String,
    pub embedding: Embedding,
}

impl IdentityRecord {
    pub fn new(id_real: impl Into<String>, full_name: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            id_real: id_real.into(),
            full_name: full_name.into(),
            embedding,
        }
    }
}

/// Best gallery candidate for a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Gallery key of the match, `None` when the score did not clear the threshold.
    pub key: Option<String>,
    /// Raw best score, reported even on rejection.
    pub score: f32,
}

impl MatchResult {
    pub fn unknown(score: f32) -> Self {
        Self { key: None, score }
    }

    pub fn matched(key: impl Into<String>, score: f32) -> Self {
        Self {
            key: Some(key.into()),
            score,
        }
    }

    pub fn is_match(&self) -> bool {
        self.key.is_some()
    }

    /// Matched key, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        self.key.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Final per-face result consumed by UI, attendance and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub bbox: BoundingBox,
    /// Display label: identity key, `"FAKE: {key}"`, or `"Unknown"`.
    pub label: String,
    /// Matched identity key regardless of liveness.
    pub identity_key: Option<String>,
    /// Similarity score of the match; liveness never alters it.
    pub confidence: f32,
    /// Only meaningful when `identity_key` is set.
    pub is_real: bool,
    /// Liveness score; `-1.0` means the liveness check itself failed.
    pub spoof_score: f32,
}

impl RecognitionOutcome {
    pub fn is_recognized(&self) -> bool {
        self.identity_key.is_some()
    }

    /// Recognized and passed liveness: eligible for an attendance event.
    pub fn is_accepted(&self) -> bool {
        self.is_recognized() && self.is_real
    }

    pub fn id_real(&self) -> Option<&str> {
        self.identity_key.as_deref().map(id_from_key)
    }
}
