// Face verification: capture, liveness checks, embedding, decision, enrollment

pub mod decision;
pub mod enrollment;
pub mod pipeline;
pub mod strategies;
pub mod types;

pub use decision::{liveness_failed, Decision, DecisionPolicy, MatchEvidence};
pub use enrollment::{fingerprint, EnrollmentError, EnrollmentPipeline, EnrollmentRecord, EnrollmentStatus};
pub use pipeline::BiometricPipeline;
pub use strategies::{cosine_similarity, CosineSimilarity, EmbeddingModel, LivenessChecker, SimilarityScorer};
pub use types::{
    CheckVerdict, EmbeddingError, FaceEmbedding, LivenessCheck, LivenessChecks, PipelineError, PipelineMode,
    PipelineStage, RawFrame, Stage, VerificationOutcome,
};
