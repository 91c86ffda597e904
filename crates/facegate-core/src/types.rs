use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Caption used for a face that no enrolled identity claimed.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Pixel region of one detected face, in probe image coordinates.
///
/// Edges are inclusive-exclusive in the usual image sense: `left..right`
/// columns and `top..bottom` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    /// Detector score in [0, 1].
    #[serde(default)]
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Build a box from float corner coordinates, clamped to a `width`×`height` image.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let clamp_x = |v: f32| v.round().clamp(0.0, width as f32) as u32;
        let clamp_y = |v: f32| v.round().clamp(0.0, height as f32) as u32;
        Self {
            top: clamp_y(y1.min(y2)),
            right: clamp_x(x1.max(x2)),
            bottom: clamp_y(y1.max(y2)),
            left: clamp_x(x1.min(x2)),
            confidence: 0.0,
            landmarks: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Uses constant-time computation: always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Detector speed/accuracy trade-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Coarse pass on a downscaled input.
    #[default]
    #[serde(alias = "hog")]
    Fast,
    /// Full-resolution pass; slower, finds smaller faces.
    #[serde(alias = "cnn")]
    Accurate,
}

impl DetectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMode::Fast => "fast",
            DetectionMode::Accurate => "accurate",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(DetectionMode::Fast),
            "accurate" | "cnn" => Ok(DetectionMode::Accurate),
            other => Err(format!("unknown detection mode '{other}' (expected fast or accurate)")),
        }
    }
}

/// Identity a probe face resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum ResolvedLabel {
    Known(String),
    Unknown,
}

impl ResolvedLabel {
    pub fn as_str(&self) -> &str {
        match self {
            ResolvedLabel::Known(label) => label,
            ResolvedLabel::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ResolvedLabel::Known(_))
    }

    /// True when this resolved to the enrolled identity `label`.
    pub fn is(&self, label: &str) -> bool {
        matches!(self, ResolvedLabel::Known(known) if known == label)
    }
}

impl fmt::Display for ResolvedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ResolvedLabel> for String {
    fn from(label: ResolvedLabel) -> Self {
        match label {
            ResolvedLabel::Known(label) => label,
            ResolvedLabel::Unknown => UNKNOWN_LABEL.to_string(),
        }
    }
}

/// Per-face outcome of one recognition pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Position of the face in detector output order.
    pub index: usize,
    pub bounding_box: BoundingBox,
    pub label: ResolvedLabel,
    /// Reference embeddings of `label` that voted for this face (0 when unknown).
    pub votes: usize,
}
