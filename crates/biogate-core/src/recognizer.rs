//! Face encoder via ONNX Runtime.
//!
//! Aligns the face to the canonical 112×112 crop and runs an embedding
//! network (ArcFace-style). The raw output is L2-normalized; its length is
//! whatever the model produces and becomes the encoding length.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::face::{FaceEncoder, FaceError, FaceLandmarks};
use crate::frame::ImageFrame;
use crate::types::{BoundingBox, FaceEncoding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding-network face encoder.
pub struct OnnxFaceEncoder {
    session: Session,
    model_version: String,
}

impl OnnxFaceEncoder {
    /// Load the encoder model. `model_version` tags every encoding it produces.
    pub fn load(model_path: &Path, model_version: impl Into<String>) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        let model_version = model_version.into();

        tracing::info!(path = %model_path.display(), model_version, "loaded face encoder");
        Ok(Self {
            session,
            model_version,
        })
    }

    fn run(&mut self, frame: &ImageFrame, landmarks: &FaceLandmarks) -> Result<FaceEncoding, RecognizerError> {
        let aligned = alignment::align_face(frame, &landmarks.alignment_points());
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values = l2_normalize(raw)?;
        Ok(FaceEncoding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(
        &mut self,
        frame: &ImageFrame,
        _face: &BoundingBox,
        landmarks: &FaceLandmarks,
    ) -> Result<FaceEncoding, FaceError> {
        Ok(self.run(frame, landmarks)?)
    }
}

/// 112×112 aligned luma crop → NCHW float tensor.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (i, &p) in aligned.iter().take(size * size).enumerate() {
        let (y, x) = (i / size, i % size);
        let v = (p as f32 - ENCODER_MEAN) / ENCODER_STD;
        for c in 0..3 {
            tensor[[0, c, y, x]] = v;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Result<Vec<f32>, RecognizerError> {
    if raw.is_empty() {
        return Err(RecognizerError::InferenceFailed("empty embedding".into()));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed("non-finite embedding".into()));
    }
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    Ok(if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    })
}
