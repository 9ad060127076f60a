use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Axis-aligned face box in integer pixel coordinates.
///
/// Coordinates are inclusive: a box spanning `x1..=x2` is `x2 - x1 + 1` pixels wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Inclusive pixel width.
    pub fn width(&self) -> i32 {
        self.x2 - self.x1 + 1
    }

    /// Inclusive pixel height.
    pub fn height(&self) -> i32 {
        self.y2 - self.y1 + 1
    }

    /// Inclusive pixel area, zero for inverted boxes.
    pub fn area(&self) -> f64 {
        let w = self.width().max(0) as f64;
        let h = self.height().max(0) as f64;
        w * h
    }

    /// True when the box has no interior (`x2 <= x1` or `y2 <= y1`).
    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

/// A face box with its detection confidence in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredBox {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl ScoredBox {
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self { bbox, confidence }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]; 0.0 if either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        crate::matcher::cosine_similarity(&self.values, &other.values)
    }
}

/// Key of an enrolled person (the student id on the roster).
///
/// Rosters deliver ids either as JSON numbers or strings; both normalize to text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for IdentityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        let id = match RawId::deserialize(deserializer)? {
            RawId::Text(s) => s,
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
        };
        if id.is_empty() {
            return Err(serde::de::Error::custom("empty identity id"));
        }
        Ok(Self(id))
    }
}
