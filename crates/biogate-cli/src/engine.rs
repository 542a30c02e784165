use crate::config::Settings;
use crate::store::SqliteStore;
use biogate_core::detector::{DetectorOptions, ScrfdDetector};
use biogate_core::landmarks::OnnxLandmarkLocator;
use biogate_core::recognizer::OnnxFaceEncoder;
use biogate_core::{
    AuthDecision, EnrollmentDecision, FaceExtractor, FaceProbe, Identity, Orchestrator, StoreError,
    TemplateStore, VerificationPolicy, VerifyError, VoiceProbe,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] biogate_core::detector::DetectorError),
    #[error("landmark model error: {0}")]
    Landmarks(#[from] biogate_core::landmarks::LandmarkError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] biogate_core::recognizer::RecognizerError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("template store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from command handlers to the engine thread.
enum EngineRequest {
    Verify {
        identity: Identity,
        face: FaceProbe,
        voice: Option<VoiceProbe>,
        policy: VerificationPolicy,
        reply: oneshot::Sender<Result<AuthDecision, EngineError>>,
    },
    Enroll {
        identity: Identity,
        face: FaceProbe,
        voice: Option<VoiceProbe>,
        reply: oneshot::Sender<Result<EnrollmentDecision, EngineError>>,
    },
    Update {
        identity: Identity,
        face: Option<FaceProbe>,
        voice: Option<VoiceProbe>,
        reply: oneshot::Sender<Result<EnrollmentDecision, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn verify(
        &self,
        identity: Identity,
        face: FaceProbe,
        voice: Option<VoiceProbe>,
        policy: VerificationPolicy,
    ) -> Result<AuthDecision, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            identity,
            face,
            voice,
            policy,
            reply,
        })
        .await
    }

    /// Enroll and persist the accepted template.
    pub async fn enroll(
        &self,
        identity: Identity,
        face: FaceProbe,
        voice: Option<VoiceProbe>,
    ) -> Result<EnrollmentDecision, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            identity,
            face,
            voice,
            reply,
        })
        .await
    }

    /// Replace the supplied factors and persist the new template version.
    pub async fn update(
        &self,
        identity: Identity,
        face: Option<FaceProbe>,
        voice: Option<VoiceProbe>,
    ) -> Result<EnrollmentDecision, EngineError> {
        self.call(|reply| EngineRequest::Update {
            identity,
            face,
            voice,
            reply,
        })
        .await
    }
}

/// Load the three ONNX models and start the engine. Fails fast if any
/// model is missing.
pub fn spawn_engine(settings: &Settings, store: Arc<SqliteStore>) -> Result<EngineHandle, EngineError> {
    let detector = ScrfdDetector::load(&settings.detector_model_path(), DetectorOptions::default())?;
    let locator = OnnxLandmarkLocator::load(&settings.landmark_model_path())?;
    let encoder = OnnxFaceEncoder::load(&settings.encoder_model_path(), settings.models.encoder_version.clone())?;

    let analyzer = FaceExtractor::new(detector, locator, encoder)
        .with_contrast_enhancement(settings.biometric.face.enhance_contrast);
    let orchestrator = Orchestrator::new(
        settings.biometric.clone(),
        Box::new(analyzer),
        store.clone(),
        store.clone(),
    )?;
    spawn_with(orchestrator, store)
}

/// Run `orchestrator` on a dedicated OS thread. Accepted templates are
/// proposed to `templates` before the reply is sent.
pub fn spawn_with(
    mut orchestrator: Orchestrator,
    templates: Arc<dyn TemplateStore>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("biogate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify {
                        identity,
                        face,
                        voice,
                        policy,
                        reply,
                    } => {
                        let result = orchestrator
                            .verify(&identity, &face, voice.as_ref(), &policy)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Enroll {
                        identity,
                        face,
                        voice,
                        reply,
                    } => {
                        let result = orchestrator
                            .enroll(&identity, &face, voice.as_ref())
                            .map_err(EngineError::from)
                            .and_then(|d| persist(templates.as_ref(), d));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Update {
                        identity,
                        face,
                        voice,
                        reply,
                    } => {
                        let result = orchestrator
                            .update(&identity, face.as_ref(), voice.as_ref())
                            .map_err(EngineError::from)
                            .and_then(|d| persist(templates.as_ref(), d));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn persist(templates: &dyn TemplateStore, decision: EnrollmentDecision) -> Result<EnrollmentDecision, EngineError> {
    if let EnrollmentDecision::Accepted(template) = &decision {
        templates.propose(template)?;
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use biogate_core::face::{FaceError, FaceLandmarks, FaceObservation, FACE_LANDMARK_COUNT};
    use biogate_core::types::BoundingBox;
    use biogate_core::{BiometricConfig, FaceAnalyzer, FaceEncoding, FailureReason, ImageFrame};

    /// Always finds a confident, wide-eyed face with a fixed encoding.
    struct StillFace;

    impl FaceAnalyzer for StillFace {
        fn analyze(&mut self, _frame: &ImageFrame) -> Result<Option<FaceObservation>, FaceError> {
            let mut points: Vec<(f32, f32)> = (0..FACE_LANDMARK_COUNT).map(|i| (i as f32, i as f32)).collect();
            for (eye, cx) in [(36usize, 30.0f32), (42, 70.0)] {
                points[eye..eye + 6].copy_from_slice(&[
                    (cx - 1.0, 50.0),
                    (cx - 0.5, 49.6),
                    (cx + 0.5, 49.6),
                    (cx + 1.0, 50.0),
                    (cx + 0.5, 50.4),
                    (cx - 0.5, 50.4),
                ]);
            }
            Ok(Some(FaceObservation {
                face: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 8.0,
                    height: 8.0,
                    confidence: 0.95,
                    landmarks: None,
                },
                landmarks: FaceLandmarks::new(points)?,
            }))
        }

        fn encode(&mut self, _frame: &ImageFrame, _obs: &FaceObservation) -> Result<FaceEncoding, FaceError> {
            Ok(FaceEncoding::new(vec![0.5, 0.5]))
        }
    }

    fn probe() -> FaceProbe {
        FaceProbe::single(ImageFrame::from_luma(vec![180; 64], 8, 8).unwrap())
    }

    #[tokio::test]
    async fn test_enroll_persists_and_verify_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("engine.db")).unwrap());
        let orchestrator =
            Orchestrator::new(BiometricConfig::default(), Box::new(StillFace), store.clone(), store.clone()).unwrap();
        let engine = spawn_with(orchestrator, store.clone()).unwrap();

        let id: Identity = "alice".into();
        let decision = engine.enroll(id.clone(), probe(), None).await.unwrap();
        assert!(matches!(decision, EnrollmentDecision::Accepted(ref t) if t.version == 1));
        assert_eq!(store.fetch(&id).unwrap().unwrap().version, 1);

        // a single still frame cannot show a blink
        let d = engine
            .verify(id.clone(), probe(), None, VerificationPolicy::default())
            .await
            .unwrap();
        assert_eq!(d.reason(), Some(FailureReason::LivenessCheckFailed));

        let relaxed = VerificationPolicy {
            require_liveness: false,
            ..VerificationPolicy::default()
        };
        assert!(engine.verify(id.clone(), probe(), None, relaxed).await.unwrap().is_success());

        let updated = engine.update(id.clone(), Some(probe()), None).await.unwrap();
        assert!(matches!(updated, EnrollmentDecision::Accepted(ref t) if t.version == 2));
        assert_eq!(store.fetch(&id).unwrap().unwrap().version, 2);
    }
}
