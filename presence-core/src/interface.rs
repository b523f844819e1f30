use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use tokio::sync::mpsc;

use crate::biometric::types::{FaceEmbedding, RawFrame};
use crate::data_structures::AttendanceRecord;
use crate::proximity::types::BeaconReading;

// Generic error type for collaborator operations (radio, camera, storage)
pub type SourceError = Box<dyn Error + Send + Sync>;

// Identifies one running radio scan so it can be stopped later
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanHandle(pub u64);

/// Short-range radio that reports beacon sightings.
/// Implementations wrap the platform Bluetooth stack, or a simulator.
#[async_trait]
pub trait RadioSource: Send + Sync {
    /// Asks the platform for scan permission. `false` means denied.
    async fn request_permission(&self) -> bool;

    /// Starts scanning. Readings are pushed into `sink` until the scan is
    /// stopped or the receiver is dropped.
    async fn start_scan(&self, sink: mpsc::Sender<BeaconReading>) -> Result<ScanHandle, SourceError>;

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), SourceError>;
}

/// Camera stream used by the biometric pipeline.
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Opens the stream. `Ok(false)` means the user refused camera access.
    async fn start_capture(&self) -> Result<bool, SourceError>;

    /// Releases the stream. Must be safe to call when nothing is running.
    async fn stop_capture(&self);

    /// Current frame size, `None` until the stream delivers usable frames.
    fn frame_dimensions(&self) -> Option<(u32, u32)>;

    async fn capture_frame(&self) -> Result<Option<RawFrame>, SourceError>;
}

/// Storage for enrolled reference embeddings, one per student.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn get_reference_embedding(&self, student_id: &str) -> Result<Option<FaceEmbedding>, SourceError>;

    /// Replaces any previous reference for the student.
    async fn put_reference_embedding(&self, student_id: &str, embedding: FaceEmbedding) -> Result<(), SourceError>;
}

/// Keyed attendance storage. Durability is the implementation's problem,
/// the fusion engine only reads and upserts through this trait.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn upsert(&self, record: AttendanceRecord) -> Result<(), SourceError>;

    async fn get(&self, student_id: &str, session_id: &str) -> Result<Option<AttendanceRecord>, SourceError>;

    async fn list_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, SourceError>;
}
