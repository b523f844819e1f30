use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::biometric::types::FaceEmbedding;
use crate::data_structures::{AttendanceRecord, LedgerKey, StudentId};
use crate::interface::{AttendanceStore, ReferenceStore, SourceError};

// --- Attendance store ---

/// Keyed in-memory ledger storage. Counts upserts so tests can check that a
/// replayed event wrote nothing.
#[derive(Clone, Default)]
pub struct InMemoryAttendanceStore {
    records: Arc<RwLock<HashMap<LedgerKey, AttendanceRecord>>>,
    upserts: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    // Makes every following upsert fail, to exercise store error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<AttendanceRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl AttendanceStore for InMemoryAttendanceStore {
    async fn upsert(&self, record: AttendanceRecord) -> Result<(), SourceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("attendance store is read-only".into());
        }
        self.records.write().await.insert(record.key(), record);
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, student_id: &str, session_id: &str) -> Result<Option<AttendanceRecord>, SourceError> {
        Ok(self
            .records
            .read()
            .await
            .get(&LedgerKey::new(student_id, session_id))
            .cloned())
    }

    async fn list_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, SourceError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

// --- Reference store ---

#[derive(Clone, Default)]
pub struct InMemoryReferenceStore {
    references: Arc<RwLock<HashMap<StudentId, FaceEmbedding>>>,
    puts: Arc<AtomicUsize>,
}

impl InMemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.references.read().await.len()
    }
}

#[async_trait]
impl ReferenceStore for InMemoryReferenceStore {
    async fn get_reference_embedding(&self, student_id: &str) -> Result<Option<FaceEmbedding>, SourceError> {
        Ok(self.references.read().await.get(student_id).cloned())
    }

    async fn put_reference_embedding(&self, student_id: &str, embedding: FaceEmbedding) -> Result<(), SourceError> {
        self.references
            .write()
            .await
            .insert(student_id.to_string(), embedding);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
