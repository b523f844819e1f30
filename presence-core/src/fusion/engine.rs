// The attendance ledger: one record per (student, session), fed by proximity,
// face verification and manual marks

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::biometric::types::VerificationOutcome;
use crate::config::FusionConfig;
use crate::data_structures::{
    AttendanceRecord, AttendanceStatus, LedgerKey, Session, SessionId, SessionStatus, StudentId,
    VerificationMethod,
};
use crate::fusion::types::{AuditAction, AuditEvent, FusionError, SessionSummary};
use crate::interface::{AttendanceStore, SourceError};
use crate::proximity::types::ProximityEstimate;

fn store_error(err: SourceError) -> FusionError {
    FusionError::Store(err.to_string())
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_seconds().max(0) as u64
}

/// Owns the session registry and all writes to the attendance store.
///
/// Every mutation for a `(student, session)` key runs under that key's lock,
/// so concurrent events for one student end in the state of some sequential
/// order. Events for different keys never wait on each other.
pub struct FusionEngine {
    store: Arc<dyn AttendanceStore>,
    config: FusionConfig,
    sessions: RwLock<HashMap<SessionId, Session>>,
    key_locks: Mutex<HashMap<LedgerKey, Arc<Mutex<()>>>>,
    audit: Option<mpsc::Sender<AuditEvent>>,
}

impl FusionEngine {
    pub fn new(store: Arc<dyn AttendanceStore>, config: FusionConfig) -> Self {
        FusionEngine {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    /// Sends every ledger decision to `tx`, typically an `AuditLog`.
    pub fn with_audit(mut self, tx: mpsc::Sender<AuditEvent>) -> Self {
        self.audit = Some(tx);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    // --- Session registry ---

    pub async fn start_session(&self, class_id: &str, beacon_id: &str) -> Session {
        self.start_session_at(class_id, beacon_id, Utc::now()).await
    }

    pub async fn start_session_at(&self, class_id: &str, beacon_id: &str, at: DateTime<Utc>) -> Session {
        let session = Session::new(&Uuid::new_v4().to_string(), class_id, beacon_id, at);
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        info!(
            "Session {} started for class {} (beacon {})",
            session.session_id, class_id, beacon_id
        );
        self.emit(AuditEvent::SessionStarted {
            session_id: session.session_id.clone(),
            class_id: class_id.to_string(),
            beacon_id: beacon_id.to_string(),
            at,
        });
        session
    }

    /// Registers a session created elsewhere, keeping its id.
    pub async fn register_session(&self, session: Session) -> Result<(), FusionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(FusionError::SessionExists(session.session_id));
        }
        debug!("Registered session {}", session.session_id);
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    // --- Signal events ---

    pub async fn apply_proximity_event(
        &self,
        student_id: &str,
        session_id: &str,
        estimate: &ProximityEstimate,
    ) -> Result<AuditAction, FusionError> {
        self.apply_proximity_event_at(student_id, session_id, estimate, Utc::now())
            .await
    }

    /// An in-range estimate for the session's beacon creates `{present, ble}`
    /// (or `late` in the grace window) when the student has no record yet.
    /// An existing absent record is upgraded; anything else is left alone.
    pub async fn apply_proximity_event_at(
        &self,
        student_id: &str,
        session_id: &str,
        estimate: &ProximityEstimate,
        at: DateTime<Utc>,
    ) -> Result<AuditAction, FusionError> {
        let (session, _) = self.arrival_status(student_id, session_id, at).await?;

        if estimate.beacon_id != session.beacon_id || !estimate.in_range {
            trace!(
                "Ignoring estimate from {} ({:.2}m, in range: {}) for {} in {}",
                estimate.beacon_id, estimate.distance_meters, estimate.in_range, student_id, session_id
            );
            self.emit(AuditEvent::ProximityApplied {
                student_id: student_id.to_string(),
                session_id: session_id.to_string(),
                action: AuditAction::Ignored,
                record: None,
                at,
            });
            return Ok(AuditAction::Ignored);
        }

        self.emit(AuditEvent::BeaconSighted {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            beacon_id: estimate.beacon_id.clone(),
            distance_meters: estimate.distance_meters,
            at,
        });

        let lock = self.key_lock(LedgerKey::new(student_id, session_id)).await;
        let guard = lock.lock().await;
        // The session may have ended since the first look
        let (session, status) = self.arrival_status(student_id, session_id, at).await?;
        let (action, record) = match self.load(student_id, session_id).await? {
            None => {
                let mut record = AttendanceRecord::new(student_id, session_id, status, VerificationMethod::Ble, at);
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Created, record)
            }
            // Beacon evidence is the weakest, it only ever replaces an absence
            Some(existing) if existing.status == AttendanceStatus::Absent => {
                let mut record = AttendanceRecord::new(student_id, session_id, status, VerificationMethod::Ble, at);
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Upgraded, record)
            }
            Some(existing) => (AuditAction::Unchanged, existing),
        };
        drop(guard);

        debug!("Proximity for {} in {}: {:?}", student_id, session_id, action);
        self.emit(AuditEvent::ProximityApplied {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            action,
            record: Some(record),
            at,
        });
        Ok(action)
    }

    pub async fn apply_verification_event(
        &self,
        student_id: &str,
        session_id: &str,
        outcome: &VerificationOutcome,
    ) -> Result<AuditAction, FusionError> {
        self.apply_verification_event_at(student_id, session_id, outcome, Utc::now())
            .await
    }

    /// A verified outcome sets `verified_by = face`, upgrading a proximity
    /// record in place. An existing face record is never touched, and a
    /// not-verified outcome never mutates anything.
    pub async fn apply_verification_event_at(
        &self,
        student_id: &str,
        session_id: &str,
        outcome: &VerificationOutcome,
        at: DateTime<Utc>,
    ) -> Result<AuditAction, FusionError> {
        self.arrival_status(student_id, session_id, at).await?;

        if !outcome.verified {
            debug!(
                "Verification for {} in {} not verified (similarity {:.3}, liveness {:.3})",
                student_id,
                session_id,
                outcome.similarity,
                outcome.liveness_confidence()
            );
            self.emit(AuditEvent::VerificationApplied {
                student_id: student_id.to_string(),
                session_id: session_id.to_string(),
                action: AuditAction::Ignored,
                confidence: outcome.confidence,
                record: None,
                at,
            });
            return Ok(AuditAction::Ignored);
        }

        let lock = self.key_lock(LedgerKey::new(student_id, session_id)).await;
        let guard = lock.lock().await;
        let (session, status) = self.arrival_status(student_id, session_id, at).await?;
        let (action, record) = match self.load(student_id, session_id).await? {
            None => {
                let mut record = AttendanceRecord::new(student_id, session_id, status, VerificationMethod::Face, at);
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Created, record)
            }
            Some(existing) if existing.status == AttendanceStatus::Absent => {
                let mut record = AttendanceRecord::new(student_id, session_id, status, VerificationMethod::Face, at);
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Upgraded, record)
            }
            Some(mut existing) if VerificationMethod::Face > existing.verified_by => {
                // First-seen time and status carry over from the weaker record
                existing.verified_by = VerificationMethod::Face;
                finalize_duration(&mut existing, &session);
                self.save(existing.clone()).await?;
                (AuditAction::Upgraded, existing)
            }
            // Face already, or a faculty override
            Some(existing) => (AuditAction::Unchanged, existing),
        };
        drop(guard);

        debug!("Verification for {} in {}: {:?}", student_id, session_id, action);
        self.emit(AuditEvent::VerificationApplied {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            action,
            confidence: outcome.confidence,
            record: Some(record),
            at,
        });
        Ok(action)
    }

    pub async fn apply_manual_mark(
        &self,
        student_id: &str,
        session_id: &str,
        status: AttendanceStatus,
    ) -> Result<AuditAction, FusionError> {
        self.apply_manual_mark_at(student_id, session_id, status, Utc::now())
            .await
    }

    /// Faculty override. Always writes `verified_by = manual` with `status`,
    /// including after the session has ended.
    pub async fn apply_manual_mark_at(
        &self,
        student_id: &str,
        session_id: &str,
        status: AttendanceStatus,
        at: DateTime<Utc>,
    ) -> Result<AuditAction, FusionError> {
        self.require_session(Some(student_id), session_id, at).await?;

        let lock = self.key_lock(LedgerKey::new(student_id, session_id)).await;
        let guard = lock.lock().await;
        let session = self.require_session(Some(student_id), session_id, at).await?;
        let (action, record) = match self.load(student_id, session_id).await? {
            Some(existing) if existing.status == status && existing.verified_by == VerificationMethod::Manual => {
                (AuditAction::Unchanged, existing)
            }
            Some(existing) => {
                let mut record = existing.clone();
                record.status = status;
                record.verified_by = VerificationMethod::Manual;
                if existing.status == AttendanceStatus::Absent {
                    record.recorded_at = at;
                }
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Upgraded, record)
            }
            None => {
                let mut record = AttendanceRecord::new(student_id, session_id, status, VerificationMethod::Manual, at);
                finalize_duration(&mut record, &session);
                self.save(record.clone()).await?;
                (AuditAction::Created, record)
            }
        };
        drop(guard);

        info!("Manual mark {:?} for {} in {}: {:?}", status, student_id, session_id, action);
        self.emit(AuditEvent::ManualApplied {
            student_id: student_id.to_string(),
            session_id: session_id.to_string(),
            action,
            record: Some(record),
            at,
        });
        Ok(action)
    }

    // --- Closing ---

    pub async fn end_session(&self, session_id: &str, roster: &[StudentId]) -> Result<SessionSummary, FusionError> {
        self.end_session_at(session_id, roster, Utc::now()).await
    }

    /// Ends the session at `at`. Attended records get their duration filled
    /// in, roster students without a record are marked `{absent, manual}`.
    /// Ending an already ended session changes nothing.
    pub async fn end_session_at(
        &self,
        session_id: &str,
        roster: &[StudentId],
        at: DateTime<Utc>,
    ) -> Result<SessionSummary, FusionError> {
        // (session, ended by this call)
        let ended = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                None => None,
                Some(session) if !session.is_active() => Some((session.clone(), false)),
                Some(session) => {
                    session.end_time = Some(at);
                    session.status = SessionStatus::Ended;
                    Some((session.clone(), true))
                }
            }
        };
        let ended_at = match ended {
            Some((session, true)) => session.end_time.unwrap_or(at),
            Some((_, false)) => {
                debug!("Session {} already ended", session_id);
                return self.summary(session_id).await;
            }
            None => {
                return Err(self.reject(None, session_id, FusionError::SessionNotFound(session_id.to_string()), at))
            }
        };

        // Every key that can hold a record: stored ones, in-flight ones
        // (their key lock was taken before the session ended) and the roster
        let mut students: BTreeSet<StudentId> = self
            .list(session_id)
            .await?
            .into_iter()
            .map(|record| record.student_id)
            .collect();
        students.extend(self.locked_students(session_id).await);
        students.extend(roster.iter().cloned());

        let mut finalized = 0;
        let mut absent = 0;
        for student_id in &students {
            let lock = self.key_lock(LedgerKey::new(student_id, session_id)).await;
            let _guard = lock.lock().await;
            // Re-read under the key lock, the record may have moved on
            match self.load(student_id, session_id).await? {
                Some(mut current) if current.counts_as_attended() && current.duration_seconds == 0 => {
                    current.duration_seconds = seconds_between(current.recorded_at, ended_at);
                    self.save(current).await?;
                    finalized += 1;
                }
                Some(_) => {}
                None if roster.contains(student_id) => {
                    let record = AttendanceRecord::new(
                        student_id,
                        session_id,
                        AttendanceStatus::Absent,
                        VerificationMethod::Manual,
                        ended_at,
                    );
                    self.save(record).await?;
                    absent += 1;
                }
                None => {}
            }
        }

        self.prune_key_locks(session_id).await;
        info!(
            "Session {} ended: {} absent, {} durations finalized",
            session_id, absent, finalized
        );
        self.emit(AuditEvent::SessionClosed {
            session_id: session_id.to_string(),
            absent,
            finalized,
            at: ended_at,
        });
        self.summary(session_id).await
    }

    // --- Queries ---

    pub async fn record(&self, student_id: &str, session_id: &str) -> Result<Option<AttendanceRecord>, FusionError> {
        self.load(student_id, session_id).await
    }

    /// All records for a known session, ordered by student id.
    pub async fn session_records(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, FusionError> {
        if self.session(session_id).await.is_none() {
            return Err(FusionError::SessionNotFound(session_id.to_string()));
        }
        let mut records = self.list(session_id).await?;
        records.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        Ok(records)
    }

    pub async fn summary(&self, session_id: &str) -> Result<SessionSummary, FusionError> {
        let records = self.session_records(session_id).await?;
        Ok(SessionSummary::from_records(session_id, &records))
    }

    // --- Internals ---

    // Session lookup plus the status an arrival at `at` would get
    async fn arrival_status(
        &self,
        student_id: &str,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(Session, AttendanceStatus), FusionError> {
        let session = self.require_session(Some(student_id), session_id, at).await?;
        match session.window_at(at, self.config.late_grace).arrival_status() {
            Some(status) => Ok((session, status)),
            None => {
                let ended_at = session.end_time.unwrap_or(at);
                Err(self.reject(
                    Some(student_id),
                    session_id,
                    FusionError::SessionClosed {
                        session_id: session_id.to_string(),
                        ended_at,
                    },
                    at,
                ))
            }
        }
    }

    async fn require_session(
        &self,
        student_id: Option<&str>,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Session, FusionError> {
        match self.session(session_id).await {
            Some(session) => Ok(session),
            None => Err(self.reject(
                student_id,
                session_id,
                FusionError::SessionNotFound(session_id.to_string()),
                at,
            )),
        }
    }

    fn reject(&self, student_id: Option<&str>, session_id: &str, err: FusionError, at: DateTime<Utc>) -> FusionError {
        warn!("Rejecting event for {:?} in {}: {}", student_id, session_id, err);
        self.emit(AuditEvent::Rejected {
            student_id: student_id.map(str::to_string),
            session_id: session_id.to_string(),
            reason: err.to_string(),
            at,
        });
        err
    }

    async fn key_lock(&self, key: LedgerKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn locked_students(&self, session_id: &str) -> Vec<StudentId> {
        self.key_locks
            .lock()
            .await
            .keys()
            .filter(|key| key.session_id == session_id)
            .map(|key| key.student_id.clone())
            .collect()
    }

    // Drops key locks nobody holds or waits on. Safe under the map lock:
    // a new holder has to go through the map first.
    async fn prune_key_locks(&self, session_id: &str) {
        let mut locks = self.key_locks.lock().await;
        locks.retain(|key, lock| key.session_id != session_id || Arc::strong_count(lock) > 1);
    }

    async fn load(&self, student_id: &str, session_id: &str) -> Result<Option<AttendanceRecord>, FusionError> {
        self.store.get(student_id, session_id).await.map_err(store_error)
    }

    async fn save(&self, record: AttendanceRecord) -> Result<(), FusionError> {
        self.store.upsert(record).await.map_err(store_error)
    }

    async fn list(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, FusionError> {
        self.store.list_session(session_id).await.map_err(store_error)
    }

    fn emit(&self, event: AuditEvent) {
        let Some(tx) = &self.audit else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Audit channel full, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => trace!("Audit log gone, event dropped"),
        }
    }
}

// Attended records on an ended session get their time in class
fn finalize_duration(record: &mut AttendanceRecord, session: &Session) {
    match (record.counts_as_attended(), session.end_time) {
        (true, Some(end)) => record.duration_seconds = seconds_between(record.recorded_at, end),
        _ => record.duration_seconds = 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::mocks::InMemoryAttendanceStore;
    use crate::test_utils::{in_range_estimate, out_of_range_estimate, verified_outcome};
    use chrono::Duration as ChronoDuration;

    async fn engine_with_session() -> (FusionEngine, Arc<InMemoryAttendanceStore>, Session) {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let engine = FusionEngine::new(store.clone(), FusionConfig::default());
        let session = engine.start_session("class_1", "beacon_001").await;
        (engine, store, session)
    }

    #[tokio::test]
    async fn proximity_creates_ble_record_once() {
        let (engine, store, session) = engine_with_session().await;
        let id = &session.session_id;

        let action = engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        assert_eq!(action, AuditAction::Created);
        let action = engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        assert_eq!(action, AuditAction::Unchanged);

        let record = engine.record("S1", id).await.unwrap().unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.verified_by, VerificationMethod::Ble);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_or_foreign_beacon_is_ignored() {
        let (engine, store, session) = engine_with_session().await;
        let id = &session.session_id;
        assert_eq!(
            engine.apply_proximity_event("S1", id, &out_of_range_estimate("beacon_001")).await.unwrap(),
            AuditAction::Ignored
        );
        assert_eq!(
            engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_999")).await.unwrap(),
            AuditAction::Ignored
        );
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn scenario_d_ble_upgraded_to_face_in_place() {
        let (engine, _store, session) = engine_with_session().await;
        let id = &session.session_id;
        engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        let first_seen = engine.record("S1", id).await.unwrap().unwrap().recorded_at;

        let action = engine.apply_verification_event("S1", id, &verified_outcome()).await.unwrap();
        assert_eq!(action, AuditAction::Upgraded);

        let records = engine.session_records(id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verified_by, VerificationMethod::Face);
        assert_eq!(records[0].status, AttendanceStatus::Present);
        assert_eq!(records[0].recorded_at, first_seen);

        // Face never goes back to ble
        engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        assert_eq!(
            engine.record("S1", id).await.unwrap().unwrap().verified_by,
            VerificationMethod::Face
        );
    }

    #[tokio::test]
    async fn verification_replay_changes_nothing() {
        let (engine, store, session) = engine_with_session().await;
        let id = &session.session_id;
        let outcome = verified_outcome();
        assert_eq!(engine.apply_verification_event("S1", id, &outcome).await.unwrap(), AuditAction::Created);
        let before = engine.record("S1", id).await.unwrap();
        for _ in 0..5 {
            assert_eq!(
                engine.apply_verification_event("S1", id, &outcome).await.unwrap(),
                AuditAction::Unchanged
            );
        }
        assert_eq!(engine.record("S1", id).await.unwrap(), before);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn unverified_outcome_never_mutates() {
        let (engine, store, session) = engine_with_session().await;
        let mut outcome = verified_outcome();
        outcome.verified = false;
        let action = engine
            .apply_verification_event("S1", &session.session_id, &outcome)
            .await
            .unwrap();
        assert_eq!(action, AuditAction::Ignored);
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_before_mutation() {
        let (engine, store, _) = engine_with_session().await;
        let err = engine
            .apply_proximity_event("S1", "nope", &in_range_estimate("beacon_001"))
            .await
            .unwrap_err();
        assert_eq!(err, FusionError::SessionNotFound("nope".to_string()));
        assert!(engine.apply_manual_mark("S1", "nope", AttendanceStatus::Present).await.is_err());
        assert!(engine.end_session("nope", &[]).await.is_err());
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn late_grace_and_closed_window() {
        let (engine, _store, session) = engine_with_session().await;
        let id = &session.session_id;
        let end = session.start_time + ChronoDuration::minutes(90);
        let roster = vec!["S1".to_string(), "S2".to_string(), "S3".to_string()];

        engine
            .apply_proximity_event_at("S1", id, &in_range_estimate("beacon_001"), session.start_time)
            .await
            .unwrap();
        let summary = engine.end_session_at(id, &roster, end).await.unwrap();
        assert_eq!((summary.present, summary.absent), (1, 2));

        let s1 = engine.record("S1", id).await.unwrap().unwrap();
        assert_eq!(s1.duration_seconds, 90 * 60);

        // Five minutes after the end: absent becomes late
        let action = engine
            .apply_proximity_event_at("S2", id, &in_range_estimate("beacon_001"), end + ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert_eq!(action, AuditAction::Upgraded);
        let s2 = engine.record("S2", id).await.unwrap().unwrap();
        assert_eq!(s2.status, AttendanceStatus::Late);
        assert_eq!(s2.verified_by, VerificationMethod::Ble);

        // Past the grace window nothing automated gets through
        let err = engine
            .apply_verification_event_at("S3", id, &verified_outcome(), end + ChronoDuration::minutes(11))
            .await
            .unwrap_err();
        assert!(matches!(err, FusionError::SessionClosed { ended_at, .. } if ended_at == end));
        assert_eq!(
            engine.record("S3", id).await.unwrap().unwrap().status,
            AttendanceStatus::Absent
        );
    }

    #[tokio::test]
    async fn signals_written_after_close_get_their_duration() {
        let (engine, _store, session) = engine_with_session().await;
        let id = &session.session_id;
        let end = session.start_time + ChronoDuration::minutes(60);
        engine.end_session_at(id, &["S2".to_string(), "S3".to_string()], end).await.unwrap();

        // Seen ten minutes into class, delivered after the close
        let seen = session.start_time + ChronoDuration::minutes(10);
        let action = engine
            .apply_proximity_event_at("S2", id, &in_range_estimate("beacon_001"), seen)
            .await
            .unwrap();
        assert_eq!(action, AuditAction::Upgraded);
        let s2 = engine.record("S2", id).await.unwrap().unwrap();
        assert_eq!(s2.status, AttendanceStatus::Present);
        assert_eq!(s2.duration_seconds, 50 * 60);

        engine
            .apply_verification_event_at("S3", id, &verified_outcome(), seen)
            .await
            .unwrap();
        let s3 = engine.record("S3", id).await.unwrap().unwrap();
        assert_eq!(s3.verified_by, VerificationMethod::Face);
        assert_eq!(s3.duration_seconds, 50 * 60);
    }

    #[tokio::test]
    async fn events_racing_the_close_are_all_finalized() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let engine = Arc::new(FusionEngine::new(store, FusionConfig::default()));
        let session = engine.start_session("class_1", "beacon_001").await;
        let start = session.start_time;
        let end = start + ChronoDuration::minutes(60);
        let roster: Vec<StudentId> = (0..20).map(|i| format!("S{}", i)).collect();

        let mut handles = Vec::new();
        for student_id in roster.clone() {
            let engine = engine.clone();
            let id = session.session_id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply_proximity_event_at(&student_id, &id, &in_range_estimate("beacon_001"), start)
                    .await
            }));
        }
        engine.end_session_at(&session.session_id, &roster, end).await.unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records = engine.session_records(&session.session_id).await.unwrap();
        assert_eq!(records.len(), roster.len());
        for record in records {
            assert_eq!(record.status, AttendanceStatus::Present, "{}", record.student_id);
            assert_eq!(record.duration_seconds, 60 * 60, "{}", record.student_id);
        }
    }

    #[tokio::test]
    async fn ending_twice_is_a_no_op() {
        let (engine, _store, session) = engine_with_session().await;
        let id = &session.session_id;
        let end = session.start_time + ChronoDuration::minutes(50);
        engine.end_session_at(id, &["S1".to_string()], end).await.unwrap();
        let summary = engine
            .end_session_at(id, &["S1".to_string(), "S2".to_string()], end + ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(engine.session(id).await.unwrap().end_time, Some(end));
    }

    #[tokio::test]
    async fn manual_marks_override_and_block_automation() {
        let (engine, _store, session) = engine_with_session().await;
        let id = &session.session_id;
        engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        assert_eq!(
            engine.apply_manual_mark("S1", id, AttendanceStatus::Late).await.unwrap(),
            AuditAction::Upgraded
        );
        assert_eq!(
            engine.apply_manual_mark("S1", id, AttendanceStatus::Late).await.unwrap(),
            AuditAction::Unchanged
        );
        assert_eq!(
            engine.apply_verification_event("S1", id, &verified_outcome()).await.unwrap(),
            AuditAction::Unchanged
        );
        let record = engine.record("S1", id).await.unwrap().unwrap();
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.verified_by, VerificationMethod::Manual);

        // An absent mark can still be overturned by a face match
        engine.apply_manual_mark("S2", id, AttendanceStatus::Absent).await.unwrap();
        assert_eq!(
            engine.apply_verification_event("S2", id, &verified_outcome()).await.unwrap(),
            AuditAction::Upgraded
        );
        assert_eq!(
            engine.record("S2", id).await.unwrap().unwrap().verified_by,
            VerificationMethod::Face
        );
    }

    #[tokio::test]
    async fn signals_only_replace_weaker_methods() {
        let (engine, store, session) = engine_with_session().await;
        let id = &session.session_id;
        let quiz = AttendanceRecord::new("S1", id, AttendanceStatus::Late, VerificationMethod::Quiz, session.start_time);
        store.upsert(quiz.clone()).await.unwrap();

        // Beacon evidence ranks below a quiz answer
        assert_eq!(
            engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap(),
            AuditAction::Unchanged
        );
        assert_eq!(engine.record("S1", id).await.unwrap(), Some(quiz.clone()));

        assert_eq!(
            engine.apply_verification_event("S1", id, &verified_outcome()).await.unwrap(),
            AuditAction::Upgraded
        );
        let record = engine.record("S1", id).await.unwrap().unwrap();
        assert_eq!(record.verified_by, VerificationMethod::Face);
        assert_eq!(record.status, AttendanceStatus::Late);
        assert_eq!(record.recorded_at, quiz.recorded_at);
    }

    #[tokio::test]
    async fn audit_trail_records_decisions() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let (tx, mut rx) = mpsc::channel(32);
        let engine = FusionEngine::new(store, FusionConfig::default()).with_audit(tx);
        let session = engine.start_session("class_1", "beacon_001").await;
        let id = &session.session_id;

        engine.apply_proximity_event("S1", id, &in_range_estimate("beacon_001")).await.unwrap();
        engine.apply_verification_event("S1", id, &verified_outcome()).await.unwrap();
        let _ = engine.apply_proximity_event("S1", "nope", &in_range_estimate("beacon_001")).await;
        drop(engine);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(serde_json::to_value(&event).unwrap()["kind"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "session_started",
                "beacon_sighted",
                "proximity_applied",
                "verification_applied",
                "rejected"
            ]
        );
    }
}
