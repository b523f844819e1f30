// presence-core/src/simulation/mod.rs

pub mod mocks;
pub mod sources;

// Re-export key simulation components
pub use mocks::{InMemoryAttendanceStore, InMemoryReferenceStore};
pub use sources::{
    FixedEmbeddingModel, HashEmbeddingModel, ManualRadio, RandomizedLivenessChecker, ScriptedLivenessChecker,
    SimulatedBeacon, SimulatedCamera, SimulatedRadio,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::biometric::enrollment::{EnrollmentError, EnrollmentPipeline, EnrollmentRecord, EnrollmentStatus};
use crate::biometric::pipeline::BiometricPipeline;
use crate::checkin::{CheckInCoordinator, CheckInReport};
use crate::config::SystemConfig;
use crate::data_structures::{AttendanceRecord, Session, StudentId};
use crate::fusion::audit::AuditLog;
use crate::fusion::engine::FusionEngine;
use crate::fusion::types::{AuditEvent, FusionError, SessionSummary};
use crate::proximity::monitor::ProximityMonitor;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("simulation task failed: {0}")]
    Task(String),
}

/// Parameters for one simulated class session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassroomConfig {
    pub class_id: String,
    pub beacon_id: String,
    pub students: usize,
    pub absent_students: usize, // The last N students never come near the beacon
    pub unenrolled_students: usize, // The first N students skip enrollment
    pub max_enrollment_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub check_in_timeout: Duration,
    pub seed: u64,
    pub system: SystemConfig,
}

impl Default for ClassroomConfig {
    fn default() -> Self {
        ClassroomConfig {
            class_id: "class_101".to_string(),
            beacon_id: "beacon_001".to_string(),
            students: 12,
            absent_students: 2,
            unenrolled_students: 1,
            max_enrollment_attempts: 3,
            check_in_timeout: Duration::from_secs(5),
            seed: 2024,
            system: SystemConfig::default(),
        }
    }
}

impl ClassroomConfig {
    pub fn roster(&self) -> Vec<StudentId> {
        (1..=self.students).map(|i| format!("S{:03}", i)).collect()
    }

    fn is_in_room(&self, index: usize) -> bool {
        index < self.students.saturating_sub(self.absent_students)
    }
}

/// One student's phone: its own radio, camera and pipeline.
struct StudentDevice {
    student_id: StudentId,
    monitor: ProximityMonitor,
    pipeline: Arc<BiometricPipeline>,
}

#[derive(Debug, Serialize)]
pub struct ClassroomReport {
    pub session: Session,
    pub enrollments: Vec<EnrollmentRecord>,
    pub records: Vec<AttendanceRecord>,
    pub summary: SessionSummary,
    pub audit: Vec<AuditEvent>,
}

/// Wires the core to simulated collaborators and runs one session end to end:
/// enroll, start the session, check everyone in concurrently, close.
pub struct ClassroomSimulation {
    config: ClassroomConfig,
    engine: Arc<FusionEngine>,
    references: Arc<InMemoryReferenceStore>,
    audit_task: JoinHandle<AuditLog>,
    devices: Vec<StudentDevice>,
}

impl ClassroomSimulation {
    pub fn build(config: ClassroomConfig) -> Self {
        let system = &config.system;
        let (audit_tx, mut audit_log) = AuditLog::channel(system.fusion.audit_channel_capacity);
        let audit_task = tokio::spawn(async move {
            audit_log.run().await;
            audit_log
        });

        let store = Arc::new(InMemoryAttendanceStore::new());
        let engine = Arc::new(FusionEngine::new(store, system.fusion.clone()).with_audit(audit_tx));
        let references = Arc::new(InMemoryReferenceStore::new());

        let devices = config
            .roster()
            .into_iter()
            .enumerate()
            .map(|(index, student_id)| {
                let seed = config.seed.wrapping_add(index as u64);
                // In the room: around 5m from the beacon. Elsewhere: well past range
                let beacon = if config.is_in_room(index) {
                    SimulatedBeacon::new(&config.beacon_id, -45, 10)
                } else {
                    SimulatedBeacon::new(&config.beacon_id, -95, 3)
                };
                let radio = Arc::new(SimulatedRadio::new(vec![beacon], system.proximity.scan_interval, seed));
                let camera = Arc::new(SimulatedCamera::new(640, 480).with_subject(&student_id));
                let pipeline = Arc::new(BiometricPipeline::new(
                    camera,
                    Arc::new(RandomizedLivenessChecker::new(seed)),
                    Arc::new(HashEmbeddingModel),
                    system.biometric.clone(),
                ));
                StudentDevice {
                    student_id,
                    monitor: ProximityMonitor::new(radio, system.proximity.clone()),
                    pipeline,
                }
            })
            .collect();

        ClassroomSimulation {
            config,
            engine,
            references,
            audit_task,
            devices,
        }
    }

    pub async fn run(self) -> Result<ClassroomReport, SimulationError> {
        let ClassroomSimulation {
            config,
            engine,
            references,
            audit_task,
            devices,
        } = self;
        let cancel = CancellationToken::new();

        // 1. Enrollment, retried by the caller up to the configured attempts
        let mut enrollments = Vec::new();
        for device in devices.iter().skip(config.unenrolled_students) {
            let enrollment = EnrollmentPipeline::new(device.pipeline.clone(), references.clone());
            for attempt in 1..=config.max_enrollment_attempts.max(1) {
                let record = enrollment.enroll(&device.student_id, &cancel).await?;
                let enrolled = record.status == EnrollmentStatus::Enrolled;
                if !enrolled {
                    info!("Enrollment attempt {} for {} failed", attempt, device.student_id);
                }
                enrollments.push(record);
                if enrolled {
                    break;
                }
            }
        }

        // 2. Session and concurrent check-ins
        let session = engine.start_session(&config.class_id, &config.beacon_id).await;
        let coordinator = Arc::new(CheckInCoordinator::new(engine.clone(), references.clone()));
        let mut handles = Vec::new();
        for (index, device) in devices.into_iter().enumerate() {
            let coordinator = coordinator.clone();
            let session_id = session.session_id.clone();
            let cancel = cancel.clone();
            let timeout = config.check_in_timeout;
            let in_room = config.is_in_room(index);
            handles.push(tokio::spawn(async move {
                let student_id = &device.student_id;
                if in_room {
                    let report = coordinator
                        .check_in(student_id, &session_id, &device.monitor, &device.pipeline, timeout, &cancel)
                        .await;
                    log_report(student_id, &report);
                } else if let Err(e) = coordinator
                    .check_in_by_proximity(student_id, &session_id, &device.monitor, timeout)
                    .await
                {
                    // Away from class: the scan runs out and no face check is attempted
                    info!("{} not in range: {}", student_id, e);
                }
            }));
        }
        for handle in handles {
            handle.await.map_err(|e| SimulationError::Task(e.to_string()))?;
        }

        // 3. Close with the full roster
        let summary = engine.end_session(&session.session_id, &config.roster()).await?;
        let records = engine.session_records(&session.session_id).await?;
        let session = engine.session(&session.session_id).await.unwrap_or(session);

        // Closing the last sender ends the audit collector
        drop(coordinator);
        drop(engine);
        let audit = match audit_task.await {
            Ok(log) => log.events().await,
            Err(e) => {
                warn!("Audit collector failed: {}", e);
                Vec::new()
            }
        };

        Ok(ClassroomReport {
            session,
            enrollments,
            records,
            summary,
            audit,
        })
    }
}

fn log_report(student_id: &str, report: &CheckInReport) {
    match &report.proximity {
        Ok(checkin) => info!(
            "{} proximity check-in at {:.2}m: {:?}",
            student_id, checkin.estimate.distance_meters, checkin.action
        ),
        Err(e) => info!("{} proximity check-in failed: {}", student_id, e),
    }
    match &report.face {
        Ok(checkin) => info!(
            "{} face check-in verified={} confidence={:.3}: {:?}",
            student_id, checkin.outcome.verified, checkin.outcome.confidence, checkin.action
        ),
        Err(e) => info!("{} face check-in failed: {}", student_id, e),
    }
}
