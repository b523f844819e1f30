// Replaceable strategies for the pipeline's stages

use async_trait::async_trait;

use crate::biometric::types::{CheckVerdict, FaceEmbedding, LivenessCheck, RawFrame};
use crate::interface::SourceError;

/// Runs a single liveness check against a captured frame.
#[async_trait]
pub trait LivenessChecker: Send + Sync {
    async fn run_check(&self, check: LivenessCheck, frame: &RawFrame) -> Result<CheckVerdict, SourceError>;
}

/// Turns a frame into a fixed-length embedding.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, frame: &RawFrame) -> Result<FaceEmbedding, SourceError>;
}

/// Match score between a fresh embedding and a stored reference, in [0, 1].
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, current: &FaceEmbedding, reference: &FaceEmbedding) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CosineSimilarity;

impl SimilarityScorer for CosineSimilarity {
    fn score(&self, current: &FaceEmbedding, reference: &FaceEmbedding) -> f64 {
        cosine_similarity(current.vector(), reference.vector())
    }
}

/// Cosine similarity clamped into [0, 1]. Mismatched lengths, empty input
/// and zero-norm vectors all score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    let similarity = dot / denominator;
    if similarity.is_finite() {
        similarity.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
