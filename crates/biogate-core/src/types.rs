use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A 2D landmark coordinate in frame pixel space.
pub type Point = (f32, f32);

/// Opaque, stable identifier of an enrolled subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Bounding box for a detected face, with optional five-point landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[Point; 5]>,
}

impl BoundingBox {
    pub fn center(&self) -> Point {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Fixed-length face encoding vector.
///
/// The length is set by the encoder model; encodings of different length
/// cannot be compared (see [`crate::matcher::euclidean_distance`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding {
    pub values: Vec<f32>,
    /// Model version that produced this encoding (e.g. "w600k_r50").
    pub model_version: Option<String>,
}

impl FaceEncoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered sequence of equal-width cepstral feature frames.
///
/// Construction validates that the sequence is non-empty and every frame
/// has the same, non-zero width. Deserialization goes through the same check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct VoiceFeatureSequence {
    frames: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SequenceShapeError {
    #[error("feature sequence is empty")]
    Empty,
    #[error("feature frames have zero width")]
    ZeroWidth,
    #[error("frame {index} has width {actual}, expected {expected}")]
    RaggedFrame {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

impl VoiceFeatureSequence {
    pub fn new(frames: Vec<Vec<f64>>) -> Result<Self, SequenceShapeError> {
        let width = frames.first().ok_or(SequenceShapeError::Empty)?.len();
        if width == 0 {
            return Err(SequenceShapeError::ZeroWidth);
        }
        if let Some((index, frame)) = frames.iter().enumerate().find(|(_, f)| f.len() != width) {
            return Err(SequenceShapeError::RaggedFrame {
                index,
                expected: width,
                actual: frame.len(),
            });
        }
        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[Vec<f64>] {
        &self.frames
    }

    /// Number of frames (varies with audio duration).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false: empty sequences cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of coefficients per frame.
    pub fn width(&self) -> usize {
        self.frames[0].len()
    }
}

impl TryFrom<Vec<Vec<f64>>> for VoiceFeatureSequence {
    type Error = SequenceShapeError;

    fn try_from(frames: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        Self::new(frames)
    }
}

impl From<VoiceFeatureSequence> for Vec<Vec<f64>> {
    fn from(seq: VoiceFeatureSequence) -> Self {
        seq.frames
    }
}

/// Eye-contour landmarks for one detected face in one frame.
///
/// Each eye holds six points in the usual contour order: p1 and p4 are the
/// horizontal corners, (p2, p6) and (p3, p5) the vertical pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkFrame {
    pub left_eye: [Point; 6],
    pub right_eye: [Point; 6],
}

/// A stored biometric template for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub id: Uuid,
    pub identity: Identity,
    pub face: FaceEncoding,
    pub voice: Option<VoiceFeatureSequence>,
    /// Monotonic revision; each accepted enrollment or update increments it.
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}
