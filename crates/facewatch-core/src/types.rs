use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Detected face rectangle in frame pixel coordinates, with optional landmarks.
///
/// Coordinates come straight from the detector and may fall outside the
/// frame; use [`FaceRegion::expanded`] to obtain a crop that is safe to index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Grow the region by `margin` pixels on every side and clamp it to a
    /// `width` × `height` frame.
    ///
    /// A region lying entirely outside the frame collapses to a zero-area
    /// rectangle rather than wrapping or going negative.
    pub fn expanded(&self, margin: u32, width: u32, height: u32) -> CropRect {
        let m = i64::from(margin);
        let clamp = |v: i64, max: u32| v.clamp(0, i64::from(max)) as u32;

        let top = clamp(i64::from(self.top) - m, height);
        let left = clamp(i64::from(self.left) - m, width);
        let bottom = clamp(i64::from(self.bottom) + m, height).max(top);
        let right = clamp(i64::from(self.right) + m, width).max(left);

        CropRect { top, left, bottom, right }
    }
}

/// Half-open pixel rectangle `[top, bottom) × [left, right)` inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Face embedding vector (typically 128- or 512-dimensional for FaceNet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Fingerprint of the graph that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Whether two embeddings live in the same metric space.
    pub fn comparable(&self, other: &Embedding) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Incomparable embeddings are infinitely far apart, so they can never
    /// satisfy a match threshold.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if !self.comparable(other) {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A known identity in the gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    /// Identity label, derived from the reference image's file stem.
    pub label: String,
    pub embedding: Embedding,
    pub source: PathBuf,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Label of the matched entry (if any).
    pub identity: Option<String>,
    /// Distance to the matched entry, or to the closest entry when nothing matched.
    pub distance: f32,
}

impl MatchResult {
    pub fn no_match(distance: f32) -> Self {
        Self {
            matched: false,
            identity: None,
            distance,
        }
    }
}
