// Simulated radio, camera and biometric strategies

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::biometric::strategies::{EmbeddingModel, LivenessChecker};
use crate::biometric::types::{CheckVerdict, FaceEmbedding, LivenessCheck, RawFrame};
use crate::config::EMBEDDING_DIMENSIONS;
use crate::interface::{CameraSource, RadioSource, ScanHandle, SourceError};
use crate::proximity::types::BeaconReading;

// --- Radios ---

#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedBeacon {
    pub beacon_id: String,
    pub base_rssi: i32,
    pub jitter: i32, // Readings vary uniformly within +/- jitter dBm
}

impl SimulatedBeacon {
    pub fn new(beacon_id: &str, base_rssi: i32, jitter: i32) -> Self {
        SimulatedBeacon {
            beacon_id: beacon_id.to_string(),
            base_rssi,
            jitter: jitter.abs(),
        }
    }
}

/// Radio that reports every configured beacon once per scan interval with
/// seeded noise on the RSSI.
pub struct SimulatedRadio {
    beacons: Vec<SimulatedBeacon>,
    interval: Duration,
    seed: u64,
    permission: AtomicBool,
    next_handle: AtomicU64,
    scans: Mutex<HashMap<u64, CancellationToken>>,
    active: Arc<AtomicUsize>,
}

impl SimulatedRadio {
    pub fn new(beacons: Vec<SimulatedBeacon>, interval: Duration, seed: u64) -> Self {
        SimulatedRadio {
            beacons,
            interval,
            seed,
            permission: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            scans: Mutex::new(HashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn deny_permission(self) -> Self {
        self.permission.store(false, Ordering::SeqCst);
        self
    }

    pub fn active_scans(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioSource for SimulatedRadio {
    async fn request_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, sink: mpsc::Sender<BeaconReading>) -> Result<ScanHandle, SourceError> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.scans.lock().await.insert(id, token.clone());
        self.active.fetch_add(1, Ordering::SeqCst);

        let beacons = self.beacons.clone();
        let interval = self.interval;
        let mut rng = SmallRng::seed_from_u64(self.seed ^ id);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            'scan: loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for beacon in &beacons {
                            let rssi = beacon.base_rssi + rng.gen_range(-beacon.jitter..=beacon.jitter);
                            if sink.send(BeaconReading::new(&beacon.beacon_id, rssi)).await.is_err() {
                                trace!("Scan {} receiver dropped", id);
                                break 'scan;
                            }
                        }
                    }
                }
            }
            debug!("Simulated scan {} finished", id);
        });
        Ok(ScanHandle(id))
    }

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), SourceError> {
        match self.scans.lock().await.remove(&handle.0) {
            Some(token) => {
                token.cancel();
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(format!("unknown scan handle {}", handle.0).into()),
        }
    }
}

/// Radio driven by the test: readings only arrive through `emit`.
pub struct ManualRadio {
    permission: AtomicBool,
    available: AtomicBool,
    permission_requests: AtomicUsize,
    scans_started: AtomicUsize,
    next_handle: AtomicU64,
    sinks: Mutex<HashMap<u64, mpsc::Sender<BeaconReading>>>,
    active: AtomicUsize,
}

impl ManualRadio {
    pub fn new(permission: bool) -> Self {
        ManualRadio {
            permission: AtomicBool::new(permission),
            available: AtomicBool::new(true),
            permission_requests: AtomicUsize::new(0),
            scans_started: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            sinks: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    // An unavailable radio fails every start_scan
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    pub fn scans_started(&self) -> usize {
        self.scans_started.load(Ordering::SeqCst)
    }

    pub fn active_scans(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Delivers `reading` to every running scan.
    pub async fn emit(&self, reading: BeaconReading) {
        let sinks: Vec<_> = self.sinks.lock().await.values().cloned().collect();
        for sink in sinks {
            let _ = sink.send(reading.clone()).await;
        }
    }
}

#[async_trait]
impl RadioSource for ManualRadio {
    async fn request_permission(&self) -> bool {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        self.permission.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, sink: mpsc::Sender<BeaconReading>) -> Result<ScanHandle, SourceError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err("bluetooth adapter is powered off".into());
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().await.insert(id, sink);
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ScanHandle(id))
    }

    async fn stop_scan(&self, handle: ScanHandle) -> Result<(), SourceError> {
        if self.sinks.lock().await.remove(&handle.0).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// --- Camera ---

/// Camera whose frames are derived from the current subject, so the same
/// person always produces the same frame.
pub struct SimulatedCamera {
    dimensions: Option<(u32, u32)>,
    permission: bool,
    subject: RwLock<String>,
    capturing: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl SimulatedCamera {
    pub fn new(width: u32, height: u32) -> Self {
        SimulatedCamera {
            dimensions: Some((width, height)),
            permission: true,
            subject: RwLock::new("nobody".to_string()),
            capturing: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission = false;
        self
    }

    // Stream opens but never reports a frame size
    pub fn not_ready(mut self) -> Self {
        self.dimensions = None;
        self
    }

    pub fn with_subject(self, subject: &str) -> Self {
        SimulatedCamera {
            subject: RwLock::new(subject.to_string()),
            ..self
        }
    }

    pub async fn set_subject(&self, subject: &str) {
        *self.subject.write().await = subject.to_string();
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraSource for SimulatedCamera {
    async fn start_capture(&self) -> Result<bool, SourceError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.permission {
            return Ok(false);
        }
        self.capturing.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn stop_capture(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
    }

    fn frame_dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    async fn capture_frame(&self) -> Result<Option<RawFrame>, SourceError> {
        if !self.is_capturing() {
            return Err("camera stream not started".into());
        }
        let (width, height) = match self.dimensions {
            Some(dims) => dims,
            None => return Ok(None),
        };
        let digest = Sha256::digest(self.subject.read().await.as_bytes());
        // Small thumbnail, not a full-resolution buffer
        let pixels = digest.iter().copied().cycle().take(32 * 32).collect();
        Ok(Some(RawFrame {
            width,
            height,
            pixels,
            captured_at: Utc::now(),
        }))
    }
}

// --- Liveness ---

/// Each check passes at a fixed rate, drawn from a seeded generator.
pub struct RandomizedLivenessChecker {
    rng: Mutex<SmallRng>,
    face_quality_rate: f64,
    blink_rate: f64,
    head_movement_rate: f64,
}

impl RandomizedLivenessChecker {
    pub fn new(seed: u64) -> Self {
        RandomizedLivenessChecker {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            face_quality_rate: 0.85,
            blink_rate: 0.8,
            head_movement_rate: 0.75,
        }
    }

    pub fn with_pass_rates(mut self, face_quality: f64, blink: f64, head_movement: f64) -> Self {
        self.face_quality_rate = face_quality.clamp(0.0, 1.0);
        self.blink_rate = blink.clamp(0.0, 1.0);
        self.head_movement_rate = head_movement.clamp(0.0, 1.0);
        self
    }
}

#[async_trait]
impl LivenessChecker for RandomizedLivenessChecker {
    async fn run_check(&self, check: LivenessCheck, _frame: &RawFrame) -> Result<CheckVerdict, SourceError> {
        let rate = match check {
            LivenessCheck::FaceQuality => self.face_quality_rate,
            LivenessCheck::Blink => self.blink_rate,
            LivenessCheck::HeadMovement => self.head_movement_rate,
        };
        let mut rng = self.rng.lock().await;
        let verdict = if rng.gen_bool(rate) {
            CheckVerdict::pass(rng.gen_range(0.8..=1.0))
        } else {
            CheckVerdict::fail(rng.gen_range(0.0..0.5))
        };
        Ok(verdict)
    }
}

/// Fixed verdicts per check, with optional per-check delays. Records the
/// order checks were run in.
pub struct ScriptedLivenessChecker {
    results: HashMap<LivenessCheck, bool>,
    score: f64,
    delays: HashMap<LivenessCheck, Duration>,
    calls: Mutex<Vec<LivenessCheck>>,
}

impl ScriptedLivenessChecker {
    pub fn new(face_quality: bool, blink: bool, head_movement: bool) -> Self {
        let results = HashMap::from([
            (LivenessCheck::FaceQuality, face_quality),
            (LivenessCheck::Blink, blink),
            (LivenessCheck::HeadMovement, head_movement),
        ]);
        ScriptedLivenessChecker {
            results,
            score: 0.9,
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn all_pass() -> Self {
        Self::new(true, true, true)
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_delay(mut self, check: LivenessCheck, delay: Duration) -> Self {
        self.delays.insert(check, delay);
        self
    }

    pub async fn calls(&self) -> Vec<LivenessCheck> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LivenessChecker for ScriptedLivenessChecker {
    async fn run_check(&self, check: LivenessCheck, _frame: &RawFrame) -> Result<CheckVerdict, SourceError> {
        self.calls.lock().await.push(check);
        if let Some(delay) = self.delays.get(&check) {
            tokio::time::sleep(*delay).await;
        }
        let passed = self.results.get(&check).copied().unwrap_or(false);
        Ok(CheckVerdict {
            passed,
            score: self.score,
        })
    }
}

// --- Embedding models ---

/// Deterministic embedding derived from the frame pixels: identical frames
/// give identical embeddings, different subjects give unrelated ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashEmbeddingModel;

#[async_trait]
impl EmbeddingModel for HashEmbeddingModel {
    async fn embed(&self, frame: &RawFrame) -> Result<FaceEmbedding, SourceError> {
        let digest = Sha256::digest(&frame.pixels);
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = SmallRng::seed_from_u64(u64::from_le_bytes(seed));
        let vector = (0..EMBEDDING_DIMENSIONS).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Ok(FaceEmbedding::new(vector, 0.95, frame.captured_at)?)
    }
}

/// Always returns the same embedding, optionally after a delay or not at all.
pub struct FixedEmbeddingModel {
    embedding: FaceEmbedding,
    delay: Option<Duration>,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl FixedEmbeddingModel {
    pub fn new(embedding: FaceEmbedding) -> Self {
        FixedEmbeddingModel {
            embedding,
            delay: None,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingModel for FixedEmbeddingModel {
    async fn embed(&self, _frame: &RawFrame) -> Result<FaceEmbedding, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(reason) => Err(reason.clone().into()),
            None => Ok(self.embedding.clone()),
        }
    }
}
