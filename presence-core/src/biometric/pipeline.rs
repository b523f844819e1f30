// Capture -> liveness -> embedding -> decision, one run at a time

use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::biometric::decision::{liveness_failed, DecisionPolicy, MatchEvidence};
use crate::biometric::strategies::{CosineSimilarity, EmbeddingModel, LivenessChecker, SimilarityScorer};
use crate::biometric::types::{
    CheckVerdict, FaceEmbedding, LivenessCheck, LivenessChecks, PipelineError, PipelineMode, PipelineStage,
    RawFrame, Stage, VerificationOutcome,
};
use crate::config::BiometricConfig;
use crate::interface::{CameraSource, SourceError};

fn stage_failure(stage: Stage, err: SourceError) -> PipelineError {
    PipelineError::StageFailure {
        stage,
        reason: err.to_string(),
    }
}

/// Liveness and embedding pipeline over an injected camera and strategies.
///
/// Runs are strictly ordered and never overlap; a second `run` while one is
/// in flight fails with `Busy`. The pipeline can be run again once a run has
/// finished, whether it completed or failed. Stage progress is published on a
/// watch channel.
pub struct BiometricPipeline {
    camera: Arc<dyn CameraSource>,
    liveness: Arc<dyn LivenessChecker>,
    model: Arc<dyn EmbeddingModel>,
    scorer: Arc<dyn SimilarityScorer>,
    config: BiometricConfig,
    policy: DecisionPolicy,
    stage: watch::Sender<PipelineStage>,
    run_lock: Mutex<()>,
}

impl BiometricPipeline {
    pub fn new(
        camera: Arc<dyn CameraSource>,
        liveness: Arc<dyn LivenessChecker>,
        model: Arc<dyn EmbeddingModel>,
        config: BiometricConfig,
    ) -> Self {
        let (stage, _) = watch::channel(PipelineStage::Idle);
        BiometricPipeline {
            camera,
            liveness,
            model,
            scorer: Arc::new(CosineSimilarity),
            policy: DecisionPolicy::from_config(&config),
            config,
            stage,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn stage(&self) -> PipelineStage {
        *self.stage.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStage> {
        self.stage.subscribe()
    }

    /// Verification run against `reference`. `None` yields a defined
    /// not-verified outcome rather than an error.
    pub async fn verify(
        &self,
        reference: Option<FaceEmbedding>,
        cancel: &CancellationToken,
    ) -> Result<VerificationOutcome, PipelineError> {
        self.run(PipelineMode::Verification(reference), cancel).await
    }

    pub async fn run(&self, mode: PipelineMode, cancel: &CancellationToken) -> Result<VerificationOutcome, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let stage = self.stage().active().unwrap_or(Stage::Capturing);
                Err(PipelineError::Cancelled { stage })
            }
            result = self.run_stages(mode) => result,
        };

        // The stream is released before the caller sees the result
        self.camera.stop_capture().await;

        match &result {
            Ok(outcome) => {
                info!(
                    "Pipeline complete: verified={} similarity={:.3} liveness={:.3}",
                    outcome.verified,
                    outcome.similarity,
                    outcome.liveness_confidence()
                );
                self.set_stage(PipelineStage::Complete);
            }
            Err(e) => {
                warn!("Pipeline failed: {}", e);
                self.set_stage(PipelineStage::Failed(e.stage().unwrap_or(Stage::Capturing)));
            }
        }
        result
    }

    async fn run_stages(&self, mode: PipelineMode) -> Result<VerificationOutcome, PipelineError> {
        self.set_stage(PipelineStage::Capturing);
        let frame = self.bounded(Stage::Capturing, self.capture()).await?;

        self.set_stage(PipelineStage::LivenessChecking);
        let liveness = self.check_liveness(&frame).await?;
        if !liveness.is_live {
            debug!("Liveness failed ({:?}), skipping embedding", liveness.failed());
            return Ok(liveness_failed(liveness));
        }

        self.set_stage(PipelineStage::EmbeddingGeneration);
        let embedding = self
            .bounded(Stage::EmbeddingGeneration, async {
                self.model
                    .embed(&frame)
                    .await
                    .map_err(|e| stage_failure(Stage::EmbeddingGeneration, e))
            })
            .await?;

        let evidence = match &mode {
            PipelineMode::Enrollment => MatchEvidence::Enrollment,
            PipelineMode::Verification(Some(reference)) => MatchEvidence::Matched {
                similarity: self.scorer.score(&embedding, reference),
            },
            PipelineMode::Verification(None) => {
                debug!("No reference embedding, run cannot verify");
                MatchEvidence::NoReference
            }
        };
        Ok(self.policy.outcome(liveness, evidence, Some(embedding)))
    }

    async fn capture(&self) -> Result<RawFrame, PipelineError> {
        let granted = self
            .camera
            .start_capture()
            .await
            .map_err(|e| stage_failure(Stage::Capturing, e))?;
        if !granted {
            return Err(PipelineError::PermissionDenied);
        }

        match self.camera.frame_dimensions() {
            Some((width, height)) if width > 0 && height > 0 => {}
            _ => return Err(PipelineError::SourceNotReady),
        }

        self.camera
            .capture_frame()
            .await
            .map_err(|e| stage_failure(Stage::Capturing, e))?
            .ok_or_else(|| PipelineError::StageFailure {
                stage: Stage::Capturing,
                reason: "camera delivered no frame".to_string(),
            })
    }

    // All three checks run, in order, each taking at least the check window.
    // The stage timeout bounds the whole stage, windows included.
    async fn check_liveness(&self, frame: &RawFrame) -> Result<LivenessChecks, PipelineError> {
        self.bounded(Stage::LivenessChecking, async {
            let mut verdicts = [CheckVerdict::fail(0.0); 3];
            for (slot, check) in verdicts.iter_mut().zip(LivenessCheck::ORDER) {
                let window = tokio::time::sleep(self.config.liveness_check_window);
                let verdict = self
                    .liveness
                    .run_check(check, frame)
                    .await
                    .map_err(|e| stage_failure(Stage::LivenessChecking, e))?;
                window.await;
                debug!("Liveness check {:?}: passed={} score={:.2}", check, verdict.passed, verdict.score);
                *slot = verdict;
            }
            let [face_quality, blink, head_movement] = verdicts;
            Ok(LivenessChecks::from_verdicts(face_quality, blink, head_movement))
        })
        .await
    }

    async fn bounded<T, F>(&self, stage: Stage, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let after = self.config.stage_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout { stage, after }),
        }
    }

    fn set_stage(&self, stage: PipelineStage) {
        self.stage.send_replace(stage);
    }
}
