// Threshold policy turning liveness and match scores into a verdict

use serde::{Deserialize, Serialize};

use crate::biometric::types::{FaceEmbedding, LivenessChecks, VerificationOutcome};
use crate::config::{BiometricConfig, LIVENESS_THRESHOLD, SIMILARITY_THRESHOLD};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub similarity_threshold: f64,
    pub liveness_threshold: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        DecisionPolicy {
            similarity_threshold: SIMILARITY_THRESHOLD,
            liveness_threshold: LIVENESS_THRESHOLD,
        }
    }
}

/// What the run had to compare against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MatchEvidence {
    /// Enrollment: the capture becomes the reference, so it matches itself.
    Enrollment,
    Matched { similarity: f64 },
    /// Verification for a student who never enrolled.
    NoReference,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verified: bool,
    pub similarity: f64,
    pub confidence: f64,
}

impl DecisionPolicy {
    pub fn from_config(config: &BiometricConfig) -> Self {
        DecisionPolicy {
            similarity_threshold: config.similarity_threshold,
            liveness_threshold: config.liveness_threshold,
        }
    }

    /// Both thresholds are strict: a score equal to the threshold fails.
    pub fn decide(&self, liveness_confidence: f64, evidence: MatchEvidence) -> Decision {
        let live = liveness_confidence > self.liveness_threshold;
        let (verified, similarity) = match evidence {
            MatchEvidence::Enrollment => (live, 1.0),
            MatchEvidence::Matched { similarity } => (live && similarity > self.similarity_threshold, similarity),
            MatchEvidence::NoReference => (false, 0.0),
        };
        Decision {
            verified,
            similarity,
            confidence: liveness_confidence.min(similarity),
        }
    }

    pub fn outcome(
        &self,
        liveness: LivenessChecks,
        evidence: MatchEvidence,
        embedding: Option<FaceEmbedding>,
    ) -> VerificationOutcome {
        let decision = self.decide(liveness.liveness_confidence, evidence);
        VerificationOutcome {
            verified: decision.verified,
            confidence: decision.confidence,
            similarity: decision.similarity,
            liveness,
            embedding,
        }
    }
}

/// Outcome for a run that failed liveness. No embedding was generated, so
/// there is no similarity and no confidence.
pub fn liveness_failed(liveness: LivenessChecks) -> VerificationOutcome {
    VerificationOutcome {
        verified: false,
        confidence: 0.0,
        similarity: 0.0,
        liveness,
        embedding: None,
    }
}
