// Drives one student's proximity scan and face verification into the ledger

use futures::future;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::biometric::pipeline::BiometricPipeline;
use crate::biometric::types::{PipelineError, VerificationOutcome};
use crate::fusion::engine::FusionEngine;
use crate::fusion::types::{AuditAction, FusionError};
use crate::interface::ReferenceStore;
use crate::proximity::monitor::ProximityMonitor;
use crate::proximity::types::{ProximityError, ProximityEstimate};

#[derive(Debug, Error)]
pub enum CheckInError {
    #[error(transparent)]
    Proximity(#[from] ProximityError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error("reference store error: {0}")]
    Store(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProximityCheckIn {
    pub estimate: ProximityEstimate,
    pub action: AuditAction,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FaceCheckIn {
    pub outcome: VerificationOutcome,
    pub action: AuditAction,
}

/// Both factors of one check-in; each succeeds or fails on its own.
#[derive(Debug)]
pub struct CheckInReport {
    pub proximity: Result<ProximityCheckIn, CheckInError>,
    pub face: Result<FaceCheckIn, CheckInError>,
}

/// Feeds a student's device signals into the shared fusion engine. The
/// monitor and pipeline belong to the student's device and are passed per
/// call; the engine and the reference store are shared.
pub struct CheckInCoordinator {
    engine: Arc<FusionEngine>,
    references: Arc<dyn ReferenceStore>,
}

impl CheckInCoordinator {
    pub fn new(engine: Arc<FusionEngine>, references: Arc<dyn ReferenceStore>) -> Self {
        CheckInCoordinator { engine, references }
    }

    pub fn engine(&self) -> &Arc<FusionEngine> {
        &self.engine
    }

    /// Scans for the session's beacon until it is in range or `timeout`
    /// expires. The scan is stopped before this returns.
    pub async fn check_in_by_proximity(
        &self,
        student_id: &str,
        session_id: &str,
        monitor: &ProximityMonitor,
        timeout: Duration,
    ) -> Result<ProximityCheckIn, CheckInError> {
        let session = self
            .engine
            .session(session_id)
            .await
            .ok_or_else(|| FusionError::SessionNotFound(session_id.to_string()))?;

        let scan = monitor.start(&session.beacon_id).await?;
        let waited = scan.wait_for_in_range(timeout).await;
        scan.stop().await;
        let estimate = waited?;

        debug!(
            "{} sees beacon {} at {:.2}m",
            student_id, estimate.beacon_id, estimate.distance_meters
        );
        let action = self
            .engine
            .apply_proximity_event(student_id, session_id, &estimate)
            .await?;
        Ok(ProximityCheckIn { estimate, action })
    }

    /// Verifies the student's face against their stored reference. A
    /// student without a reference gets a not-verified outcome, not an error.
    pub async fn check_in_by_face(
        &self,
        student_id: &str,
        session_id: &str,
        pipeline: &BiometricPipeline,
        cancel: &CancellationToken,
    ) -> Result<FaceCheckIn, CheckInError> {
        if self.engine.session(session_id).await.is_none() {
            return Err(FusionError::SessionNotFound(session_id.to_string()).into());
        }

        let reference = self
            .references
            .get_reference_embedding(student_id)
            .await
            .map_err(|e| CheckInError::Store(e.to_string()))?;
        if reference.is_none() {
            info!("{} has no reference embedding, face check cannot verify", student_id);
        }

        let outcome = pipeline.verify(reference, cancel).await?;
        let action = self
            .engine
            .apply_verification_event(student_id, session_id, &outcome)
            .await?;
        Ok(FaceCheckIn { outcome, action })
    }

    /// Runs both factors concurrently. Neither waits for the other.
    pub async fn check_in(
        &self,
        student_id: &str,
        session_id: &str,
        monitor: &ProximityMonitor,
        pipeline: &BiometricPipeline,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CheckInReport {
        let (proximity, face) = future::join(
            self.check_in_by_proximity(student_id, session_id, monitor, timeout),
            self.check_in_by_face(student_id, session_id, pipeline, cancel),
        )
        .await;
        CheckInReport { proximity, face }
    }
}
