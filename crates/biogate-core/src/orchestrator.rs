//! Verification and enrollment orchestration.
//!
//! Verification runs as a short pipeline with early exit:
//! lockout → template → face + liveness → face match → voice → success.
//! A `require_voice` policy without a voice pair fails at the voice step,
//! after the face factor has run. Every factor failure records one failed
//! attempt; lockout and `NotEnrolled` do not. Collaborator and backend faults are returned as
//! [`VerifyError`] and never counted as authentication failures.

use crate::attempts::{AttemptCache, AttemptTracker};
use crate::config::{BiometricConfig, LockoutConfig, VerificationPolicy};
use crate::decision::{AuthDecision, EnrollmentDecision, FactorsEvaluated, FailureReason};
use crate::face::{FaceAnalyzer, FaceError, FaceObservation};
use crate::frame::ImageFrame;
use crate::liveness::LivenessSession;
use crate::matcher::{self, MatchError};
use crate::store::{StoreError, TemplateStore};
use crate::types::{EnrolledTemplate, FaceEncoding, Identity, VoiceFeatureSequence};
use crate::voice::{VoiceError, VoiceExtractor};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Ordered frames captured for one face probe.
#[derive(Debug, Clone, Default)]
pub struct FaceProbe {
    pub frames: Vec<ImageFrame>,
}

impl FaceProbe {
    pub fn new(frames: Vec<ImageFrame>) -> Self {
        Self { frames }
    }

    pub fn single(frame: ImageFrame) -> Self {
        Self { frames: vec![frame] }
    }
}

/// Raw mono waveform in [-1, 1] at its native sample rate.
#[derive(Debug, Clone)]
pub struct VoiceProbe {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a pipeline step stopped.
enum Halt {
    Reject(FailureReason),
    Fault(VerifyError),
}

impl From<FailureReason> for Halt {
    fn from(reason: FailureReason) -> Self {
        Halt::Reject(reason)
    }
}

impl From<FaceError> for Halt {
    fn from(e: FaceError) -> Self {
        match e {
            FaceError::NoFaceDetected => Halt::Reject(FailureReason::NoFaceDetected),
            FaceError::LandmarkExtractionFailed(msg) => {
                tracing::debug!(%msg, "landmark extraction failed");
                Halt::Reject(FailureReason::LandmarkExtractionFailed)
            }
            other => Halt::Fault(VerifyError::Internal(other.to_string())),
        }
    }
}

impl From<MatchError> for Halt {
    fn from(e: MatchError) -> Self {
        tracing::debug!(error = %e, "incompatible template shapes");
        Halt::Reject(FailureReason::InvalidInput)
    }
}

pub struct Orchestrator {
    config: BiometricConfig,
    analyzer: Box<dyn FaceAnalyzer>,
    voice: VoiceExtractor,
    templates: Arc<dyn TemplateStore>,
    attempts: AttemptTracker,
}

impl Orchestrator {
    pub fn new(
        config: BiometricConfig,
        analyzer: Box<dyn FaceAnalyzer>,
        templates: Arc<dyn TemplateStore>,
        attempts: Arc<dyn AttemptCache>,
    ) -> Result<Self, VerifyError> {
        let voice = VoiceExtractor::new(&config.voice).map_err(|e| VerifyError::Internal(e.to_string()))?;
        let attempts = AttemptTracker::new(attempts, config.lockout.clone());
        Ok(Self {
            config,
            analyzer,
            voice,
            templates,
            attempts,
        })
    }

    pub fn config(&self) -> &BiometricConfig {
        &self.config
    }

    pub fn attempts(&self) -> &AttemptTracker {
        &self.attempts
    }

    /// Authenticate `identity` against its enrolled template.
    pub fn verify(
        &mut self,
        identity: &Identity,
        face: &FaceProbe,
        voice: Option<&VoiceProbe>,
        policy: &VerificationPolicy,
    ) -> Result<AuthDecision, VerifyError> {
        let decision = self.run_verify(identity, face, voice, policy)?;
        audit(identity, &decision);
        Ok(decision)
    }

    fn run_verify(
        &mut self,
        identity: &Identity,
        face: &FaceProbe,
        voice: Option<&VoiceProbe>,
        policy: &VerificationPolicy,
    ) -> Result<AuthDecision, VerifyError> {
        let mut factors = FactorsEvaluated::default();
        let lockout = policy.lockout(self.attempts.config());

        if self.attempts.is_locked_under(identity, &lockout)? {
            return Ok(AuthDecision::failure(FailureReason::TooManyAttempts, factors));
        }

        let Some(template) = self.templates.fetch(identity)? else {
            return Ok(AuthDecision::failure(FailureReason::NotEnrolled, factors));
        };

        factors.face = true;
        let liveness = self.config.liveness.enabled && policy.require_liveness;
        let encoding = match self.evaluate_face(face, liveness) {
            Ok(encoding) => encoding,
            Err(Halt::Reject(reason)) => return self.fail(identity, reason, factors, &lockout),
            Err(Halt::Fault(e)) => return Err(e),
        };

        match matcher::compare_faces(&encoding, &template.face, self.config.face.match_threshold) {
            Ok(m) if m.matched => {
                tracing::debug!(distance = m.distance, "face matched");
            }
            Ok(m) => {
                tracing::debug!(distance = m.distance, "face mismatch");
                return self.fail(identity, FailureReason::FaceMismatch, factors, &lockout);
            }
            Err(e) => {
                tracing::debug!(error = %e, "face comparison rejected");
                return self.fail(identity, FailureReason::InvalidInput, factors, &lockout);
            }
        }

        match (voice, template.voice.as_ref()) {
            (Some(probe), Some(enrolled)) => {
                factors.voice = true;
                match self.evaluate_voice(probe, enrolled) {
                    Ok(()) => {}
                    Err(Halt::Reject(reason)) => return self.fail(identity, reason, factors, &lockout),
                    Err(Halt::Fault(e)) => return Err(e),
                }
            }
            _ if policy.require_voice => {
                return self.fail(identity, FailureReason::VoiceRequired, factors, &lockout);
            }
            _ => {}
        }

        self.attempts.record_success(identity)?;
        Ok(AuthDecision::success(factors))
    }

    fn fail(
        &self,
        identity: &Identity,
        reason: FailureReason,
        factors: FactorsEvaluated,
        lockout: &LockoutConfig,
    ) -> Result<AuthDecision, VerifyError> {
        let count = self.attempts.record_failure_under(identity, lockout)?;
        tracing::warn!(identity = %identity, %reason, attempts = count, "verification attempt failed");
        Ok(AuthDecision::failure(reason, factors))
    }

    /// Analyse every frame, feed liveness, and encode the most confident face.
    fn evaluate_face(&mut self, probe: &FaceProbe, liveness: bool) -> Result<FaceEncoding, Halt> {
        if probe.frames.is_empty() {
            return Err(FailureReason::InvalidInput.into());
        }

        let mut session = LivenessSession::new();
        let mut best: Option<(usize, FaceObservation)> = None;

        let window = self.config.liveness.max_frames;
        if probe.frames.len() > window {
            tracing::debug!(frames = probe.frames.len(), window, "probe frames beyond the observation window ignored");
        }

        for (index, frame) in probe.frames.iter().enumerate().take(window) {
            let Some(observation) = self.analyzer.analyze(frame)? else {
                tracing::debug!(frame = index, "no face in frame");
                continue;
            };
            if liveness {
                session
                    .observe(&observation.eyes(), &self.config.liveness)
                    .map_err(|_| Halt::Reject(FailureReason::LandmarkExtractionFailed))?;
            }
            let better = best
                .as_ref()
                .map_or(true, |(_, b)| observation.face.confidence > b.face.confidence);
            if better {
                best = Some((index, observation));
            }
        }

        let (index, observation) = best.ok_or(Halt::Reject(FailureReason::NoFaceDetected))?;

        if liveness {
            let report = session.finish(&self.config.liveness).map_err(|e| {
                tracing::debug!(error = %e, "liveness not established");
                Halt::Reject(FailureReason::LivenessCheckFailed)
            })?;
            tracing::debug!(blinks = report.blinks, frames = report.frames_observed, "liveness established");
        }

        Ok(self.analyzer.encode(&probe.frames[index], &observation)?)
    }

    fn evaluate_voice(&self, probe: &VoiceProbe, enrolled: &VoiceFeatureSequence) -> Result<(), Halt> {
        let features = self.voice.extract(&probe.samples, probe.sample_rate).map_err(voice_halt)?;
        let m = matcher::compare_voices(&features, enrolled, self.config.voice.match_threshold)?;
        tracing::debug!(similarity = m.similarity, cost = m.cost, "voice compared");
        if m.matched {
            Ok(())
        } else {
            Err(FailureReason::VoiceMismatch.into())
        }
    }

    /// Validate samples and build a fresh template for `identity`.
    ///
    /// The returned template is not persisted. Re-enrolling an identity
    /// replaces its template with the next version.
    pub fn enroll(
        &mut self,
        identity: &Identity,
        face: &FaceProbe,
        voice: Option<&VoiceProbe>,
    ) -> Result<EnrollmentDecision, VerifyError> {
        if identity.as_str().trim().is_empty() {
            return Ok(EnrollmentDecision::Rejected(FailureReason::InvalidInput));
        }
        let existing = self.templates.fetch(identity)?;

        let face = match self.enrollment_face(face) {
            Ok(encoding) => encoding,
            Err(Halt::Reject(reason)) => return Ok(rejected(identity, reason)),
            Err(Halt::Fault(e)) => return Err(e),
        };
        let voice = match voice.map(|v| self.enrollment_voice(v)).transpose() {
            Ok(features) => features,
            Err(Halt::Reject(reason)) => return Ok(rejected(identity, reason)),
            Err(Halt::Fault(e)) => return Err(e),
        };

        let template = EnrolledTemplate {
            id: existing.as_ref().map_or_else(Uuid::new_v4, |t| t.id),
            identity: identity.clone(),
            face,
            voice,
            version: existing.map_or(1, |t| t.version + 1),
            updated_at: Utc::now(),
        };
        tracing::info!(
            identity = %identity,
            version = template.version,
            voice = template.voice.is_some(),
            "enrollment accepted"
        );
        Ok(EnrollmentDecision::Accepted(template))
    }

    /// Replace the supplied factors of an existing template.
    pub fn update(
        &mut self,
        identity: &Identity,
        face: Option<&FaceProbe>,
        voice: Option<&VoiceProbe>,
    ) -> Result<EnrollmentDecision, VerifyError> {
        if face.is_none() && voice.is_none() {
            return Ok(rejected(identity, FailureReason::InvalidInput));
        }
        let Some(existing) = self.templates.fetch(identity)? else {
            return Ok(rejected(identity, FailureReason::NotEnrolled));
        };

        let new_face = match face.map(|f| self.enrollment_face(f)).transpose() {
            Ok(encoding) => encoding,
            Err(Halt::Reject(reason)) => return Ok(rejected(identity, reason)),
            Err(Halt::Fault(e)) => return Err(e),
        };
        let new_voice = match voice.map(|v| self.enrollment_voice(v)).transpose() {
            Ok(features) => features,
            Err(Halt::Reject(reason)) => return Ok(rejected(identity, reason)),
            Err(Halt::Fault(e)) => return Err(e),
        };

        let template = EnrolledTemplate {
            id: existing.id,
            identity: identity.clone(),
            face: new_face.unwrap_or(existing.face),
            voice: new_voice.or(existing.voice),
            version: existing.version + 1,
            updated_at: Utc::now(),
        };
        tracing::info!(identity = %identity, version = template.version, "template update accepted");
        Ok(EnrollmentDecision::Accepted(template))
    }

    /// Pick the most confident bright frame and require it to clear the
    /// detection-confidence floor.
    fn enrollment_face(&mut self, probe: &FaceProbe) -> Result<FaceEncoding, Halt> {
        if probe.frames.is_empty() {
            return Err(FailureReason::InvalidInput.into());
        }

        let mut best: Option<(usize, FaceObservation)> = None;
        let mut lit_frames = 0usize;
        for (index, frame) in probe.frames.iter().enumerate() {
            if frame.is_dark(self.config.face.dark_frame_fraction) {
                tracing::debug!(frame = index, "dark frame skipped");
                continue;
            }
            lit_frames += 1;
            if let Some(observation) = self.analyzer.analyze(frame)? {
                if best
                    .as_ref()
                    .map_or(true, |(_, b)| observation.face.confidence > b.face.confidence)
                {
                    best = Some((index, observation));
                }
            }
        }

        if lit_frames == 0 {
            return Err(FailureReason::LowQuality.into());
        }
        let (index, observation) = best.ok_or(Halt::Reject(FailureReason::NoFaceDetected))?;
        if observation.face.confidence < self.config.face.detection_confidence {
            tracing::debug!(confidence = observation.face.confidence, "detection below enrollment floor");
            return Err(FailureReason::LowQuality.into());
        }

        Ok(self.analyzer.encode(&probe.frames[index], &observation)?)
    }

    fn enrollment_voice(&self, probe: &VoiceProbe) -> Result<VoiceFeatureSequence, Halt> {
        self.voice.extract(&probe.samples, probe.sample_rate).map_err(|e| match e {
            VoiceError::InsufficientAudioQuality(_) => Halt::Reject(FailureReason::LowQuality),
            other => voice_halt(other),
        })
    }
}

fn voice_halt(e: VoiceError) -> Halt {
    match e {
        VoiceError::InsufficientAudioQuality(quality) => {
            tracing::debug!(%quality, "voice sample failed quality gate");
            Halt::Reject(FailureReason::InsufficientAudioQuality)
        }
        VoiceError::InvalidInput(msg) => {
            tracing::debug!(%msg, "voice sample rejected");
            Halt::Reject(FailureReason::InvalidInput)
        }
        VoiceError::InvalidConfig(msg) => Halt::Fault(VerifyError::Internal(msg)),
    }
}

fn rejected(identity: &Identity, reason: FailureReason) -> EnrollmentDecision {
    tracing::info!(identity = %identity, %reason, "enrollment rejected");
    EnrollmentDecision::Rejected(reason)
}

fn audit(identity: &Identity, decision: &AuthDecision) {
    tracing::info!(
        target: "biogate::audit",
        identity = %identity,
        success = decision.is_success(),
        reason = decision.reason().map_or("none", |r| r.as_str()),
        auth_type = decision.factors_evaluated.auth_type(),
        "verification decision"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::MemoryAttemptCache;
    use crate::face::tests::landmarks_with_ear;
    use crate::face::FaceLandmarks;
    use crate::store::MemoryTemplateStore;
    use crate::types::BoundingBox;

    /// Scripted analyzer: frame brightness picks the EAR, a zero pixel means
    /// "no face", and the encoding is fixed.
    struct Scripted {
        encoding: Vec<f32>,
        confidence: f32,
    }

    impl FaceAnalyzer for Scripted {
        fn analyze(&mut self, frame: &ImageFrame) -> Result<Option<FaceObservation>, FaceError> {
            let v = frame.pixel(0, 0);
            if v == 0 {
                return Ok(None);
            }
            let ear = if v < 100 { 0.1 } else { 0.4 };
            Ok(Some(FaceObservation {
                face: BoundingBox {
                    x: 0.0, y: 0.0, width: 10.0, height: 10.0,
                    confidence: self.confidence, landmarks: None,
                },
                landmarks: FaceLandmarks::new(landmarks_with_ear(ear))?,
            }))
        }

        fn encode(&mut self, _: &ImageFrame, _: &FaceObservation) -> Result<FaceEncoding, FaceError> {
            Ok(FaceEncoding::new(self.encoding.clone()))
        }
    }

    fn frame(v: u8) -> ImageFrame {
        ImageFrame::from_luma(vec![v; 4], 2, 2).unwrap()
    }

    fn blinking() -> FaceProbe {
        FaceProbe::new([200, 50, 50, 50, 200].into_iter().map(frame).collect())
    }

    fn orchestrator(encoding: Vec<f32>) -> (Orchestrator, Arc<MemoryTemplateStore>) {
        let store = Arc::new(MemoryTemplateStore::new());
        let orch = Orchestrator::new(
            BiometricConfig::default(),
            Box::new(Scripted { encoding, confidence: 0.95 }),
            store.clone(),
            Arc::new(MemoryAttemptCache::new()),
        )
        .unwrap();
        (orch, store)
    }

    fn accepted(d: EnrollmentDecision) -> EnrolledTemplate {
        match d {
            EnrollmentDecision::Accepted(t) => t,
            EnrollmentDecision::Rejected(r) => panic!("rejected: {r}"),
        }
    }

    #[test]
    fn test_enroll_then_verify() {
        let (mut orch, store) = orchestrator(vec![0.1, 0.2, 0.3]);
        let id: Identity = "u1".into();
        let t = accepted(orch.enroll(&id, &blinking(), None).unwrap());
        assert_eq!(t.version, 1);
        store.propose(&t).unwrap();

        let d = orch.verify(&id, &blinking(), None, &VerificationPolicy::default()).unwrap();
        assert!(d.is_success());
        assert_eq!(d.factors_evaluated.auth_type(), "face");
    }

    #[test]
    fn test_no_blink_fails_liveness() {
        let (mut orch, store) = orchestrator(vec![0.1]);
        let id: Identity = "u1".into();
        store.propose(&accepted(orch.enroll(&id, &blinking(), None).unwrap())).unwrap();

        let still = FaceProbe::new(vec![frame(200); 5]);
        let d = orch.verify(&id, &still, None, &VerificationPolicy::default()).unwrap();
        assert_eq!(d.reason(), Some(FailureReason::LivenessCheckFailed));
        assert_eq!(orch.attempts().attempts(&id).unwrap(), 1);

        let lax = VerificationPolicy { require_liveness: false, ..Default::default() };
        assert!(orch.verify(&id, &still, None, &lax).unwrap().is_success());
    }

    #[test]
    fn test_no_face_anywhere() {
        let (mut orch, store) = orchestrator(vec![0.1]);
        let id: Identity = "u1".into();
        store.propose(&accepted(orch.enroll(&id, &blinking(), None).unwrap())).unwrap();
        let empty = FaceProbe::new(vec![frame(0); 3]);
        let d = orch.verify(&id, &empty, None, &VerificationPolicy::default()).unwrap();
        assert_eq!(d.reason(), Some(FailureReason::NoFaceDetected));
    }

    #[test]
    fn test_not_enrolled_does_not_count() {
        let (mut orch, _) = orchestrator(vec![0.1]);
        let id: Identity = "ghost".into();
        let d = orch.verify(&id, &blinking(), None, &VerificationPolicy::default()).unwrap();
        assert_eq!(d.reason(), Some(FailureReason::NotEnrolled));
        assert_eq!(d.factors_evaluated.auth_type(), "none");
        assert_eq!(orch.attempts().attempts(&id).unwrap(), 0);
    }

    #[test]
    fn test_voice_required_without_voice() {
        let (mut orch, store) = orchestrator(vec![0.1]);
        let id: Identity = "u1".into();
        store.propose(&accepted(orch.enroll(&id, &blinking(), None).unwrap())).unwrap();
        let policy = VerificationPolicy { require_voice: true, ..Default::default() };
        let d = orch.verify(&id, &blinking(), None, &policy).unwrap();
        assert_eq!(d.reason(), Some(FailureReason::VoiceRequired));
        assert!(d.factors_evaluated.face);
        assert_eq!(orch.attempts().attempts(&id).unwrap(), 1);

        // the face factor still decides first
        let still = FaceProbe::new(vec![frame(200); 5]);
        let d = orch.verify(&id, &still, None, &policy).unwrap();
        assert_eq!(d.reason(), Some(FailureReason::LivenessCheckFailed));
    }

    #[test]
    fn test_enroll_rejects_dark_and_weak_faces() {
        let (mut orch, _) = orchestrator(vec![0.1]);
        let id: Identity = "u1".into();
        let dark = FaceProbe::single(frame(10));
        assert_eq!(orch.enroll(&id, &dark, None).unwrap(), EnrollmentDecision::Rejected(FailureReason::LowQuality));

        let store = Arc::new(MemoryTemplateStore::new());
        let mut weak = Orchestrator::new(
            BiometricConfig::default(),
            Box::new(Scripted { encoding: vec![0.1], confidence: 0.5 }),
            store,
            Arc::new(MemoryAttemptCache::new()),
        )
        .unwrap();
        assert_eq!(
            weak.enroll(&id, &FaceProbe::single(frame(200)), None).unwrap(),
            EnrollmentDecision::Rejected(FailureReason::LowQuality)
        );
    }

    #[test]
    fn test_enroll_rejects_silent_voice() {
        let (mut orch, _) = orchestrator(vec![0.1]);
        let silent = VoiceProbe { samples: vec![0.0; 16_000], sample_rate: 16_000 };
        assert_eq!(
            orch.enroll(&"u1".into(), &blinking(), Some(&silent)).unwrap(),
            EnrollmentDecision::Rejected(FailureReason::LowQuality)
        );
    }

    #[test]
    fn test_update_requires_a_factor_and_a_template() {
        let (mut orch, store) = orchestrator(vec![0.1]);
        let id: Identity = "u1".into();
        assert_eq!(
            orch.update(&id, None, None).unwrap(),
            EnrollmentDecision::Rejected(FailureReason::InvalidInput)
        );
        assert_eq!(
            orch.update(&id, Some(&blinking()), None).unwrap(),
            EnrollmentDecision::Rejected(FailureReason::NotEnrolled)
        );

        let original = accepted(orch.enroll(&id, &blinking(), None).unwrap());
        store.propose(&original).unwrap();
        let updated = accepted(orch.update(&id, Some(&blinking()), None).unwrap());
        assert_eq!(updated.version, 2);
        assert_eq!(updated.id, original.id);
        assert!(updated.voice.is_none());
    }
}
