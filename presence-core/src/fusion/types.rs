// Fusion ledger events, summaries and errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::data_structures::{
    AttendanceRecord, AttendanceStatus, BeaconId, ClassId, SessionId, StudentId, VerificationMethod,
};

/// What an event did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Created,
    Upgraded,
    Unchanged, // Record already at or above what the event could give
    Ignored,   // Event carried no usable signal (out of range, not verified)
}

impl AuditAction {
    pub fn mutated(&self) -> bool {
        matches!(self, AuditAction::Created | AuditAction::Upgraded)
    }
}

/// Audit trail entry for every ledger decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStarted {
        session_id: SessionId,
        class_id: ClassId,
        beacon_id: BeaconId,
        at: DateTime<Utc>,
    },
    BeaconSighted {
        student_id: StudentId,
        session_id: SessionId,
        beacon_id: BeaconId,
        distance_meters: f64,
        at: DateTime<Utc>,
    },
    ProximityApplied {
        student_id: StudentId,
        session_id: SessionId,
        action: AuditAction,
        record: Option<AttendanceRecord>,
        at: DateTime<Utc>,
    },
    VerificationApplied {
        student_id: StudentId,
        session_id: SessionId,
        action: AuditAction,
        confidence: f64,
        record: Option<AttendanceRecord>,
        at: DateTime<Utc>,
    },
    ManualApplied {
        student_id: StudentId,
        session_id: SessionId,
        action: AuditAction,
        record: Option<AttendanceRecord>,
        at: DateTime<Utc>,
    },
    Rejected {
        student_id: Option<StudentId>,
        session_id: SessionId,
        reason: String,
        at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: SessionId,
        absent: usize,    // Roster students marked absent on close
        finalized: usize, // Attended records that got their duration filled in
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AuditEvent::SessionStarted { session_id, .. }
            | AuditEvent::BeaconSighted { session_id, .. }
            | AuditEvent::ProximityApplied { session_id, .. }
            | AuditEvent::VerificationApplied { session_id, .. }
            | AuditEvent::ManualApplied { session_id, .. }
            | AuditEvent::Rejected { session_id, .. }
            | AuditEvent::SessionClosed { session_id, .. } => session_id,
        }
    }

    pub fn student_id(&self) -> Option<&str> {
        match self {
            AuditEvent::BeaconSighted { student_id, .. }
            | AuditEvent::ProximityApplied { student_id, .. }
            | AuditEvent::VerificationApplied { student_id, .. }
            | AuditEvent::ManualApplied { student_id, .. } => Some(student_id),
            AuditEvent::Rejected { student_id, .. } => student_id.as_deref(),
            AuditEvent::SessionStarted { .. } | AuditEvent::SessionClosed { .. } => None,
        }
    }

    pub fn action(&self) -> Option<AuditAction> {
        match self {
            AuditEvent::ProximityApplied { action, .. }
            | AuditEvent::VerificationApplied { action, .. }
            | AuditEvent::ManualApplied { action, .. } => Some(*action),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub total: usize,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    // Attended records only, keyed by how they were verified
    pub by_method: BTreeMap<VerificationMethod, usize>,
}

impl SessionSummary {
    pub fn from_records(session_id: &str, records: &[AttendanceRecord]) -> Self {
        let mut summary = SessionSummary {
            session_id: session_id.to_string(),
            total: records.len(),
            ..SessionSummary::default()
        };
        for record in records {
            match record.status {
                AttendanceStatus::Present => summary.present += 1,
                AttendanceStatus::Late => summary.late += 1,
                AttendanceStatus::Absent => summary.absent += 1,
            }
            if record.counts_as_attended() {
                *summary.by_method.entry(record.verified_by).or_insert(0) += 1;
            }
        }
        summary
    }

    /// Share of records that attended, 0 for an empty session.
    pub fn attendance_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.present + self.late) as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FusionError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} already exists")]
    SessionExists(SessionId),
    #[error("session {session_id} closed at {ended_at}")]
    SessionClosed {
        session_id: SessionId,
        ended_at: DateTime<Utc>,
    },
    #[error("attendance store error: {0}")]
    Store(String),
}
