//! 68-point landmark regressor via ONNX Runtime.
//!
//! Crops a square region around the detected face (enlarged by
//! [`CROP_SCALE`]), resizes it to the model input and decodes the
//! normalized `[-1, 1]` coordinate output back to frame pixels.

use crate::face::{FaceError, LandmarkLocator, FACE_LANDMARK_COUNT};
use crate::frame::ImageFrame;
use crate::types::{BoundingBox, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 192;
const LANDMARK_MEAN: f32 = 127.5;
const LANDMARK_STD: f32 = 128.0;
/// Crop side relative to the longer detection side.
const CROP_SCALE: f32 = 1.5;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square crop window in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropWindow {
    x0: f32,
    y0: f32,
    side: f32,
}

impl CropWindow {
    fn around(face: &BoundingBox) -> Self {
        let (cx, cy) = face.center();
        let side = face.width.max(face.height) * CROP_SCALE;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }

    /// Normalized model output in [-1, 1] → frame pixel coordinates.
    fn decode(&self, nx: f32, ny: f32) -> Point {
        let half = self.side / 2.0;
        (self.x0 + (nx + 1.0) * half, self.y0 + (ny + 1.0) * half)
    }
}

/// ONNX landmark model producing 68 (x, y) pairs.
pub struct OnnxLandmarkLocator {
    session: Session,
}

impl OnnxLandmarkLocator {
    pub fn load(model_path: &Path) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded landmark model");
        Ok(Self { session })
    }

    fn run(&mut self, frame: &ImageFrame, face: &BoundingBox) -> Result<Vec<Point>, LandmarkError> {
        let window = CropWindow::around(face);
        let input = crop_tensor(frame, &window);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        decode_points(raw, &window)
    }
}

impl LandmarkLocator for OnnxLandmarkLocator {
    fn locate(&mut self, frame: &ImageFrame, face: &BoundingBox) -> Result<Vec<Point>, FaceError> {
        self.run(frame, face).map_err(|e| match e {
            // a malformed output means the point set could not be located
            LandmarkError::InferenceFailed(msg) => FaceError::LandmarkExtractionFailed(msg),
            other => FaceError::Landmarks(other),
        })
    }
}

/// Sample the crop window into an NCHW tensor with replicated luma.
fn crop_tensor(frame: &ImageFrame, window: &CropWindow) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE;
    let step = window.side / size as f32;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        let sy = window.y0 + (y as f32 + 0.5) * step - 0.5;
        for x in 0..size {
            let sx = window.x0 + (x as f32 + 0.5) * step - 0.5;
            let v = (frame.sample_bilinear(sx, sy) - LANDMARK_MEAN) / LANDMARK_STD;
            tensor[[0, 0, y, x]] = v;
            tensor[[0, 1, y, x]] = v;
            tensor[[0, 2, y, x]] = v;
        }
    }
    tensor
}

/// Decode interleaved `[x0, y0, x1, y1, ...]` output. Models that also emit
/// a depth channel (`[x, y, z]` triples) are accepted; z is dropped.
fn decode_points(raw: &[f32], window: &CropWindow) -> Result<Vec<Point>, LandmarkError> {
    let stride = match raw.len() {
        n if n == FACE_LANDMARK_COUNT * 2 => 2,
        n if n == FACE_LANDMARK_COUNT * 3 => 3,
        n => {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} or {} values, got {n}",
                FACE_LANDMARK_COUNT * 2,
                FACE_LANDMARK_COUNT * 3
            )))
        }
    };
    Ok(raw
        .chunks_exact(stride)
        .map(|c| window.decode(c[0], c[1]))
        .collect())
}
