use log::{debug, info, trace};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::fusion::types::{AuditAction, AuditEvent};

/// Drains audit events into memory. Run it on its own task; it returns once
/// every sender (the fusion engine) is gone.
#[derive(Debug)]
pub struct AuditLog {
    rx: mpsc::Receiver<AuditEvent>,
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditLog {
    pub fn new(rx: mpsc::Receiver<AuditEvent>) -> Self {
        AuditLog {
            rx,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sender/collector pair with the given buffer size.
    pub fn channel(capacity: usize) -> (mpsc::Sender<AuditEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, AuditLog::new(rx))
    }

    /// Handle to the collected events, readable while `run` is going.
    pub fn events_handle(&self) -> Arc<Mutex<Vec<AuditEvent>>> {
        self.events.clone()
    }

    pub async fn run(&mut self) {
        debug!("Audit log collector started");
        while let Some(event) = self.rx.recv().await {
            match &event {
                AuditEvent::Rejected { student_id, session_id, reason, .. } => {
                    info!("Rejected event for {:?} in session {}: {}", student_id, session_id, reason);
                }
                AuditEvent::SessionClosed { session_id, absent, finalized, .. } => {
                    info!(
                        "Session {} closed: {} marked absent, {} finalized",
                        session_id, absent, finalized
                    );
                }
                other => trace!("Audit: {:?}", other),
            }
            self.events.lock().await.push(event);
        }
        debug!("Audit log collector finished (channel closed)");
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Trail for one student in one session, in arrival order.
    pub async fn trail(&self, student_id: &str, session_id: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.session_id() == session_id && e.student_id() == Some(student_id))
            .cloned()
            .collect()
    }

    /// Number of ledger-mutating decisions recorded so far.
    pub async fn mutation_count(&self) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.action().map_or(false, |a: AuditAction| a.mutated()))
            .count()
    }
}
