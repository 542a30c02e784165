//! Authentication and enrollment outcomes returned to the calling layer.

use crate::types::EnrolledTemplate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason code attached to every failed decision. Never carries free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoFaceDetected,
    LandmarkExtractionFailed,
    LivenessCheckFailed,
    FaceMismatch,
    InsufficientAudioQuality,
    VoiceMismatch,
    /// Policy demanded a voice factor but the probe or template had none.
    VoiceRequired,
    InvalidInput,
    TooManyAttempts,
    LowQuality,
    NotEnrolled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFaceDetected => "no_face_detected",
            Self::LandmarkExtractionFailed => "landmark_extraction_failed",
            Self::LivenessCheckFailed => "liveness_check_failed",
            Self::FaceMismatch => "face_mismatch",
            Self::InsufficientAudioQuality => "insufficient_audio_quality",
            Self::VoiceMismatch => "voice_mismatch",
            Self::VoiceRequired => "voice_required",
            Self::InvalidInput => "invalid_input",
            Self::TooManyAttempts => "too_many_attempts",
            Self::LowQuality => "low_quality",
            Self::NotEnrolled => "not_enrolled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

/// Which factors were actually evaluated before the decision was reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorsEvaluated {
    pub face: bool,
    pub voice: bool,
}

impl FactorsEvaluated {
    /// Label used in audit events ("none", "face", "face+voice").
    pub fn auth_type(&self) -> &'static str {
        match (self.face, self.voice) {
            (false, false) => "none",
            (true, false) => "face",
            (false, true) => "voice",
            (true, true) => "face+voice",
        }
    }
}

/// Final result of one verification call. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDecision {
    pub outcome: Outcome,
    pub factors_evaluated: FactorsEvaluated,
}

impl AuthDecision {
    pub fn success(factors_evaluated: FactorsEvaluated) -> Self {
        Self {
            outcome: Outcome::Success,
            factors_evaluated,
        }
    }

    pub fn failure(reason: FailureReason, factors_evaluated: FactorsEvaluated) -> Self {
        Self {
            outcome: Outcome::Failure(reason),
            factors_evaluated,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Failure(reason) => Some(reason),
        }
    }
}

/// Result of an enrollment or template update.
///
/// An accepted template has not been persisted yet; the caller proposes it
/// to its template store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "value")]
pub enum EnrollmentDecision {
    Accepted(EnrolledTemplate),
    Rejected(FailureReason),
}
