//! biogate-core — biometric matching, liveness and verification engine.
//!
//! Face encodings come from SCRFD detection, a 68-point landmark regressor
//! and an embedding network, all on ONNX Runtime. Voice features are MFCC
//! sequences compared with dynamic time warping. The [`Orchestrator`] ties
//! both factors, blink liveness and attempt lockout into one decision.

pub mod alignment;
pub mod attempts;
pub mod config;
pub mod decision;
pub mod detector;
pub mod face;
pub mod frame;
pub mod landmarks;
pub mod liveness;
pub mod matcher;
pub mod orchestrator;
pub mod recognizer;
pub mod store;
pub mod types;
pub mod voice;

use std::path::PathBuf;

pub use attempts::{AttemptCache, AttemptTracker, MemoryAttemptCache};
pub use config::{BiometricConfig, VerificationPolicy};
pub use decision::{AuthDecision, EnrollmentDecision, FactorsEvaluated, FailureReason, Outcome};
pub use face::{FaceAnalyzer, FaceExtractor};
pub use frame::ImageFrame;
pub use orchestrator::{FaceProbe, Orchestrator, VerifyError, VoiceProbe};
pub use store::{MemoryTemplateStore, StoreError, TemplateStore};
pub use types::{EnrolledTemplate, FaceEncoding, Identity, VoiceFeatureSequence};

/// Where ONNX models live when nothing else is configured:
/// `$XDG_DATA_HOME/biogate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("biogate")
        .join("models")
}
