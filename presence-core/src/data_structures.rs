use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Identifiers come from the excluded storage/HTTP layer, kept as plain strings
pub type StudentId = String;
pub type SessionId = String;
pub type ClassId = String;
pub type BeaconId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

// How a record was verified. Ordered from weakest to strongest evidence; an
// automated signal only replaces a method it outranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Ble,
    Quiz,
    Face,
    Manual,
}

impl VerificationMethod {
    pub fn label(&self) -> &'static str {
        match self {
            VerificationMethod::Ble => "BLE Only",
            VerificationMethod::Quiz => "Quiz",
            VerificationMethod::Face => "Face",
            VerificationMethod::Manual => "Manual",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub session_id: SessionId,
    pub status: AttendanceStatus,
    pub verified_by: VerificationMethod,
    pub duration_seconds: u64,
    pub recorded_at: DateTime<Utc>, // First time the student was seen for this session
}

impl AttendanceRecord {
    pub fn new(
        student_id: &str,
        session_id: &str,
        status: AttendanceStatus,
        verified_by: VerificationMethod,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        AttendanceRecord {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            status,
            verified_by,
            duration_seconds: 0,
            recorded_at,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.student_id, &self.session_id)
    }

    pub fn counts_as_attended(&self) -> bool {
        matches!(self.status, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

// Ledger key: one record per (student, session)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub student_id: StudentId,
    pub session_id: SessionId,
}

impl LedgerKey {
    pub fn new(student_id: &str, session_id: &str) -> Self {
        LedgerKey {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub class_id: ClassId,
    pub beacon_id: BeaconId, // Beacon placed in the classroom by faculty
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// Where a point in time falls relative to a session's attendance cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttendanceWindow {
    Open,   // Session running, arrivals are present
    Grace,  // Ended, but arrivals still count as late
    Closed, // No more automated marks
}

impl AttendanceWindow {
    /// Status an arrival inside this window is recorded with.
    pub fn arrival_status(&self) -> Option<AttendanceStatus> {
        match self {
            AttendanceWindow::Open => Some(AttendanceStatus::Present),
            AttendanceWindow::Grace => Some(AttendanceStatus::Late),
            AttendanceWindow::Closed => None,
        }
    }
}

impl Session {
    pub fn new(session_id: &str, class_id: &str, beacon_id: &str, start_time: DateTime<Utc>) -> Self {
        Session {
            session_id: session_id.to_string(),
            class_id: class_id.to_string(),
            beacon_id: beacon_id.to_string(),
            start_time,
            end_time: None,
            status: SessionStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn window_at(&self, at: DateTime<Utc>, late_grace: Duration) -> AttendanceWindow {
        match self.end_time {
            None => AttendanceWindow::Open,
            Some(end) if at <= end => AttendanceWindow::Open,
            Some(end) => {
                // A grace too large to represent never closes
                let cutoff = ChronoDuration::from_std(late_grace)
                    .ok()
                    .and_then(|grace| end.checked_add_signed(grace));
                match cutoff {
                    Some(cutoff) if at > cutoff => AttendanceWindow::Closed,
                    _ => AttendanceWindow::Grace,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn verification_method_ordering_reflects_trust() {
        assert!(VerificationMethod::Face > VerificationMethod::Ble);
        assert!(VerificationMethod::Manual > VerificationMethod::Face);
        assert!(VerificationMethod::Quiz > VerificationMethod::Ble);
    }

    #[test]
    fn statuses_serialize_lowercase() {
        let record = AttendanceRecord::new(
            "S1",
            "X",
            AttendanceStatus::Present,
            VerificationMethod::Ble,
            Utc::now(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "present");
        assert_eq!(json["verified_by"], "ble");
        assert_eq!(json["duration_seconds"], 0);
    }

    #[test]
    fn ledger_key_identity() {
        let mut keys = HashSet::new();
        keys.insert(LedgerKey::new("S1", "X"));
        keys.insert(LedgerKey::new("S1", "X"));
        keys.insert(LedgerKey::new("S1", "Y"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn session_window_transitions() {
        let start = Utc::now();
        let mut session = Session::new("X", "class_1", "beacon_001", start);
        let grace = Duration::from_secs(600);
        assert_eq!(session.window_at(start, grace), AttendanceWindow::Open);

        let end = start + ChronoDuration::minutes(90);
        session.end_time = Some(end);
        session.status = SessionStatus::Ended;

        assert_eq!(session.window_at(end, grace), AttendanceWindow::Open);
        assert_eq!(
            session.window_at(end + ChronoDuration::minutes(5), grace),
            AttendanceWindow::Grace
        );
        assert_eq!(
            session.window_at(end + ChronoDuration::minutes(11), grace),
            AttendanceWindow::Closed
        );
        assert_eq!(AttendanceWindow::Grace.arrival_status(), Some(AttendanceStatus::Late));
        assert_eq!(AttendanceWindow::Closed.arrival_status(), None);
    }
}
