// Types for the liveness and embedding pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::EMBEDDING_DIMENSIONS;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding must have {expected} dimensions, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("generation confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),
    #[error("embedding contains a non-finite component")]
    NonFinite,
}

// Wire form, validated on the way in
#[derive(Deserialize)]
struct RawEmbedding {
    vector: Vec<f32>,
    generation_confidence: f64,
    captured_at: DateTime<Utc>,
}

/// Fixed-length face embedding. Immutable once built: fields are only
/// reachable through accessors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEmbedding")]
pub struct FaceEmbedding {
    vector: Vec<f32>,
    generation_confidence: f64,
    captured_at: DateTime<Utc>,
}

impl TryFrom<RawEmbedding> for FaceEmbedding {
    type Error = EmbeddingError;

    fn try_from(raw: RawEmbedding) -> Result<Self, Self::Error> {
        FaceEmbedding::new(raw.vector, raw.generation_confidence, raw.captured_at)
    }
}

impl FaceEmbedding {
    pub fn new(
        vector: Vec<f32>,
        generation_confidence: f64,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, EmbeddingError> {
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(EmbeddingError::WrongLength {
                expected: EMBEDDING_DIMENSIONS,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        if !(0.0..=1.0).contains(&generation_confidence) {
            return Err(EmbeddingError::InvalidConfidence(generation_confidence));
        }
        Ok(FaceEmbedding {
            vector,
            generation_confidence,
            captured_at,
        })
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn generation_confidence(&self) -> f64 {
        self.generation_confidence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Little-endian bytes of the vector, the input to enrollment fingerprints.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// The three liveness checks, run in the order of `ORDER`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LivenessCheck {
    FaceQuality,
    Blink,
    HeadMovement,
}

impl LivenessCheck {
    pub const ORDER: [LivenessCheck; 3] = [
        LivenessCheck::FaceQuality,
        LivenessCheck::Blink,
        LivenessCheck::HeadMovement,
    ];
}

// Result of one liveness check. `score` is the checker's own certainty in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub passed: bool,
    pub score: f64,
}

impl CheckVerdict {
    pub fn pass(score: f64) -> Self {
        CheckVerdict { passed: true, score }
    }

    pub fn fail(score: f64) -> Self {
        CheckVerdict { passed: false, score }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LivenessChecks {
    pub face_quality: bool,
    pub blink_detected: bool,
    pub head_movement: bool,
    pub is_live: bool,
    pub liveness_confidence: f64,
}

impl LivenessChecks {
    /// Combines the three verdicts. A live result scores at least 0.85; a
    /// non-live one stays within [0.3, 0.7] depending on how many checks passed.
    pub fn from_verdicts(face_quality: CheckVerdict, blink: CheckVerdict, head_movement: CheckVerdict) -> Self {
        let verdicts = [face_quality, blink, head_movement];
        let is_live = verdicts.iter().all(|v| v.passed);
        let liveness_confidence = if is_live {
            let mean = verdicts.iter().map(|v| v.score.clamp(0.0, 1.0)).sum::<f64>() / 3.0;
            0.85 + 0.15 * mean
        } else {
            let passed = verdicts.iter().filter(|v| v.passed).count() as f64;
            0.3 + 0.4 * (passed / 3.0)
        };

        LivenessChecks {
            face_quality: face_quality.passed,
            blink_detected: blink.passed,
            head_movement: head_movement.passed,
            is_live,
            liveness_confidence,
        }
    }

    /// Names of the checks that did not pass, in run order.
    pub fn failed(&self) -> Vec<LivenessCheck> {
        let mut failed = Vec::new();
        if !self.face_quality {
            failed.push(LivenessCheck::FaceQuality);
        }
        if !self.blink_detected {
            failed.push(LivenessCheck::Blink);
        }
        if !self.head_movement {
            failed.push(LivenessCheck::HeadMovement);
        }
        failed
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub confidence: f64,
    pub similarity: f64,
    pub liveness: LivenessChecks,
    pub embedding: Option<FaceEmbedding>,
}

impl VerificationOutcome {
    pub fn liveness_confidence(&self) -> f64 {
        self.liveness.liveness_confidence
    }
}

// Stages that can fail, used to tag errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Capturing,
    LivenessChecking,
    EmbeddingGeneration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Capturing => "capturing",
            Stage::LivenessChecking => "liveness checking",
            Stage::EmbeddingGeneration => "embedding generation",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Idle,
    Capturing,
    LivenessChecking,
    EmbeddingGeneration,
    Complete,
    Failed(Stage),
}

impl PipelineStage {
    /// The running stage, if any.
    pub fn active(&self) -> Option<Stage> {
        match self {
            PipelineStage::Capturing => Some(Stage::Capturing),
            PipelineStage::LivenessChecking => Some(Stage::LivenessChecking),
            PipelineStage::EmbeddingGeneration => Some(Stage::EmbeddingGeneration),
            _ => None,
        }
    }
}

/// What a run is for. Verification carries the stored reference, if the
/// student has one.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineMode {
    Enrollment,
    Verification(Option<FaceEmbedding>),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera reports no usable frame dimensions")]
    SourceNotReady,
    #[error("{stage} failed: {reason}")]
    StageFailure { stage: Stage, reason: String },
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
    #[error("run cancelled during {stage}")]
    Cancelled { stage: Stage },
    #[error("a run is already in progress")]
    Busy,
}

impl PipelineError {
    /// Stage the error originated in. `Busy` is raised before any stage runs.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::PermissionDenied | PipelineError::SourceNotReady => Some(Stage::Capturing),
            PipelineError::StageFailure { stage, .. }
            | PipelineError::Timeout { stage, .. }
            | PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::Busy => None,
        }
    }
}
