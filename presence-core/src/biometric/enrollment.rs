// One-time capture of a student's reference embedding

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::biometric::pipeline::BiometricPipeline;
use crate::biometric::types::{FaceEmbedding, PipelineError, PipelineMode};
use crate::data_structures::StudentId;
use crate::interface::ReferenceStore;

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("enrollment pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("reference store error: {0}")]
    Store(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub student_id: StudentId,
    pub embedding: Option<FaceEmbedding>,
    pub fingerprint: Option<String>, // sha256 hex of the embedding bytes
    pub liveness_confidence: f64,
    pub enrolled_at: DateTime<Utc>,
    pub status: EnrollmentStatus,
}

/// SHA-256 over the little-endian embedding bytes, hex encoded.
pub fn fingerprint(embedding: &FaceEmbedding) -> String {
    let mut hasher = Sha256::new();
    hasher.update(embedding.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub struct EnrollmentPipeline {
    pipeline: Arc<BiometricPipeline>,
    references: Arc<dyn ReferenceStore>,
}

impl EnrollmentPipeline {
    pub fn new(pipeline: Arc<BiometricPipeline>, references: Arc<dyn ReferenceStore>) -> Self {
        EnrollmentPipeline { pipeline, references }
    }

    /// Captures a reference for `student_id`. A successful run replaces any
    /// previous reference outright; a run that fails liveness stores nothing
    /// and comes back with `status = failed`.
    pub async fn enroll(&self, student_id: &str, cancel: &CancellationToken) -> Result<EnrollmentRecord, EnrollmentError> {
        let outcome = self.pipeline.run(PipelineMode::Enrollment, cancel).await?;
        let liveness_confidence = outcome.liveness_confidence();

        let embedding = match outcome.embedding {
            Some(embedding) if outcome.verified => embedding,
            _ => {
                warn!(
                    "Enrollment for {} failed liveness (confidence {:.3})",
                    student_id, liveness_confidence
                );
                return Ok(EnrollmentRecord {
                    student_id: student_id.to_string(),
                    embedding: None,
                    fingerprint: None,
                    liveness_confidence,
                    enrolled_at: Utc::now(),
                    status: EnrollmentStatus::Failed,
                });
            }
        };

        let fingerprint = fingerprint(&embedding);
        self.references
            .put_reference_embedding(student_id, embedding.clone())
            .await
            .map_err(|e| EnrollmentError::Store(e.to_string()))?;
        info!("Enrolled {} with reference {}", student_id, &fingerprint[..12]);

        Ok(EnrollmentRecord {
            student_id: student_id.to_string(),
            embedding: Some(embedding),
            fingerprint: Some(fingerprint),
            liveness_confidence,
            enrolled_at: Utc::now(),
            status: EnrollmentStatus::Enrolled,
        })
    }
}
