//! Face feature extraction pipeline: detect → landmarks → encoding.
//!
//! The three stages sit behind traits so the ONNX backends in
//! [`crate::detector`], [`crate::landmarks`] and [`crate::recognizer`] can be
//! swapped for other models (or scripted stand-ins in tests).

use crate::detector::DetectorError;
use crate::frame::ImageFrame;
use crate::landmarks::LandmarkError;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, FaceEncoding, LandmarkFrame, Point};
use thiserror::Error;

/// Number of points in the 68-point face landmark layout.
pub const FACE_LANDMARK_COUNT: usize = 68;

const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const NOSE_TIP: usize = 30;
const MOUTH_LEFT: usize = 48;
const MOUTH_RIGHT: usize = 54;

const CLAHE_TILES: usize = 8;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("landmark extraction failed: {0}")]
    LandmarkExtractionFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmarks: {0}")]
    Landmarks(#[from] LandmarkError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Locates face candidates in a frame, most confident first.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &ImageFrame) -> Result<Vec<BoundingBox>, FaceError>;
}

/// Predicts the 68-point landmark set inside a detected face region.
pub trait LandmarkLocator: Send {
    fn locate(&mut self, frame: &ImageFrame, face: &BoundingBox) -> Result<Vec<Point>, FaceError>;
}

/// Turns an aligned face into a fixed-length encoding.
pub trait FaceEncoder: Send {
    fn encode(
        &mut self,
        frame: &ImageFrame,
        face: &BoundingBox,
        landmarks: &FaceLandmarks,
    ) -> Result<FaceEncoding, FaceError>;
}

/// A validated 68-point landmark set.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    points: Vec<Point>,
}

impl FaceLandmarks {
    pub fn new(points: Vec<Point>) -> Result<Self, FaceError> {
        if points.len() != FACE_LANDMARK_COUNT {
            return Err(FaceError::LandmarkExtractionFailed(format!(
                "expected {FACE_LANDMARK_COUNT} points, got {}",
                points.len()
            )));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(FaceError::LandmarkExtractionFailed(
                "non-finite landmark coordinate".into(),
            ));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Six-point eye contours used by the liveness detector.
    pub fn eyes(&self) -> LandmarkFrame {
        let take = |range: std::ops::Range<usize>| -> [Point; 6] {
            std::array::from_fn(|i| self.points[range.start + i])
        };
        LandmarkFrame {
            left_eye: take(LEFT_EYE),
            right_eye: take(RIGHT_EYE),
        }
    }

    /// Five alignment anchors: eye centres, nose tip, mouth corners.
    pub fn alignment_points(&self) -> [Point; 5] {
        let centroid = |range: std::ops::Range<usize>| -> Point {
            let n = range.len() as f32;
            let (sx, sy) = self.points[range]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        [
            centroid(LEFT_EYE),
            centroid(RIGHT_EYE),
            self.points[NOSE_TIP],
            self.points[MOUTH_LEFT],
            self.points[MOUTH_RIGHT],
        ]
    }
}

/// The primary face found in one frame, with its landmarks.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub face: BoundingBox,
    pub landmarks: FaceLandmarks,
}

impl FaceObservation {
    pub fn eyes(&self) -> LandmarkFrame {
        self.landmarks.eyes()
    }
}

/// Per-frame face analysis as the orchestrator consumes it.
pub trait FaceAnalyzer: Send {
    /// Detect and landmark the primary face. `Ok(None)` when no face is present.
    fn analyze(&mut self, frame: &ImageFrame) -> Result<Option<FaceObservation>, FaceError>;

    /// Compute the encoding for a previously analysed frame.
    fn encode(
        &mut self,
        frame: &ImageFrame,
        observation: &FaceObservation,
    ) -> Result<FaceEncoding, FaceError>;

    /// Single-frame extraction: fails with `NoFaceDetected` on an empty frame.
    fn extract(&mut self, frame: &ImageFrame) -> Result<FaceEncoding, FaceError> {
        let observation = self.analyze(frame)?.ok_or(FaceError::NoFaceDetected)?;
        self.encode(frame, &observation)
    }
}

/// Detector + landmark locator + encoder composed into a [`FaceAnalyzer`].
///
/// When the detector reports several faces, the first candidate (the most
/// confident one for detectors that sort) is the primary face. This is a
/// fixed tie-break, not an error.
pub struct FaceExtractor<D, L, E> {
    detector: D,
    locator: L,
    encoder: E,
    enhance_contrast: bool,
}

impl<D, L, E> FaceExtractor<D, L, E>
where
    D: FaceDetector,
    L: LandmarkLocator,
    E: FaceEncoder,
{
    pub fn new(detector: D, locator: L, encoder: E) -> Self {
        Self {
            detector,
            locator,
            encoder,
            enhance_contrast: false,
        }
    }

    /// Apply CLAHE to each frame before detection.
    pub fn with_contrast_enhancement(mut self, enabled: bool) -> Self {
        self.enhance_contrast = enabled;
        self
    }
}

impl<D, L, E> FaceAnalyzer for FaceExtractor<D, L, E>
where
    D: FaceDetector,
    L: LandmarkLocator,
    E: FaceEncoder,
{
    fn analyze(&mut self, frame: &ImageFrame) -> Result<Option<FaceObservation>, FaceError> {
        let enhanced;
        let frame = if self.enhance_contrast {
            let mut copy = frame.clone();
            copy.clahe(CLAHE_TILES, CLAHE_CLIP_LIMIT);
            enhanced = copy;
            &enhanced
        } else {
            frame
        };

        let candidates = self.detector.detect(frame)?;
        let Some(face) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let points = self.locator.locate(frame, &face)?;
        let landmarks = FaceLandmarks::new(points)?;
        tracing::trace!(confidence = face.confidence, "primary face landmarked");

        Ok(Some(FaceObservation { face, landmarks }))
    }

    fn encode(
        &mut self,
        frame: &ImageFrame,
        observation: &FaceObservation,
    ) -> Result<FaceEncoding, FaceError> {
        self.encoder
            .encode(frame, &observation.face, &observation.landmarks)
    }
}
