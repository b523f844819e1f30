// Scan sessions over a RadioSource: permission gate, scan task, connection state

use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ProximityConfig;
use crate::data_structures::BeaconId;
use crate::interface::{RadioSource, ScanHandle};
use crate::proximity::estimator::{estimate, ReadingBuffer};
use crate::proximity::types::{
    BeaconReading, ConnectionState, ProximityError, ProximityEstimate, ProximityEvent, ScanInput,
    SignalStrength,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

/// Owns the radio and hands out scan sessions. Constructed explicitly and
/// passed where needed; there is no process-wide scanner.
pub struct ProximityMonitor {
    radio: Arc<dyn RadioSource>,
    config: ProximityConfig,
    permission: Mutex<PermissionState>,
}

impl ProximityMonitor {
    pub fn new(radio: Arc<dyn RadioSource>, config: ProximityConfig) -> Self {
        ProximityMonitor {
            radio,
            config,
            permission: Mutex::new(PermissionState::Unknown),
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    /// Asks the radio for permission. After a denial this is the only way
    /// to scan again; `start` never re-asks on its own.
    pub async fn request_permission(&self) -> Result<(), ProximityError> {
        let granted = self.radio.request_permission().await;
        let mut permission = self.permission.lock().await;
        if granted {
            *permission = PermissionState::Granted;
            Ok(())
        } else {
            warn!("Radio permission denied");
            *permission = PermissionState::Denied;
            Err(ProximityError::PermissionDenied)
        }
    }

    /// Starts scanning for `beacon_id`. The first call asks for permission if
    /// it was never requested.
    pub async fn start(&self, beacon_id: &str) -> Result<ScanSession, ProximityError> {
        let permission = *self.permission.lock().await;
        match permission {
            PermissionState::Denied => return Err(ProximityError::PermissionDenied),
            PermissionState::Unknown => self.request_permission().await?,
            PermissionState::Granted => {}
        }

        let capacity = self.config.event_channel_capacity;
        let (reading_tx, reading_rx) = mpsc::channel(capacity);
        let handle = self
            .radio
            .start_scan(reading_tx)
            .await
            .map_err(|e| ProximityError::RadioUnavailable(e.to_string()))?;
        info!("Scan {:?} started for beacon {}", handle, beacon_id);

        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let buffer = Arc::new(Mutex::new(ReadingBuffer::default()));
        let cancel = CancellationToken::new();

        let mut scan_loop = ScanLoop {
            radio: self.radio.clone(),
            handle,
            target: beacon_id.to_string(),
            config: self.config.clone(),
            events: event_tx,
            state: state_tx,
            buffer: buffer.clone(),
        };
        // Scanning before the caller sees the session
        scan_loop.advance(ScanInput::ScanStarted);
        let task = tokio::spawn(scan_loop.run(reading_rx, cancel.clone()));

        Ok(ScanSession {
            beacon_id: beacon_id.to_string(),
            config: self.config.clone(),
            events: event_rx,
            state: state_rx,
            buffer,
            cancel,
            task: Some(task),
        })
    }
}

// State owned by the spawned scan task
struct ScanLoop {
    radio: Arc<dyn RadioSource>,
    handle: ScanHandle,
    target: BeaconId,
    config: ProximityConfig,
    events: mpsc::Sender<ProximityEvent>,
    state: watch::Sender<ConnectionState>,
    buffer: Arc<Mutex<ReadingBuffer>>,
}

impl ScanLoop {
    async fn run(mut self, mut readings: mpsc::Receiver<BeaconReading>, cancel: CancellationToken) {
        let mut last_seen = Instant::now();

        loop {
            let stale_at = last_seen + self.config.staleness_window;
            let connected = *self.state.borrow() == ConnectionState::Connected;

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Scan {:?} cancelled", self.handle);
                    break;
                }
                reading = readings.recv() => match reading {
                    Some(reading) => {
                        if self.handle_reading(reading).await {
                            last_seen = Instant::now();
                        }
                    }
                    None => {
                        warn!("Radio closed the reading channel for scan {:?}", self.handle);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(stale_at), if connected => {
                    debug!(
                        "No reading from beacon {} for {:?}, dropping connection",
                        self.target, self.config.staleness_window
                    );
                    self.advance(ScanInput::Stale);
                }
            }
        }

        self.advance(ScanInput::ScanStopped);
        // Release the radio on every exit path
        if let Err(e) = self.radio.stop_scan(self.handle).await {
            warn!("Failed to stop scan {:?}: {}", self.handle, e);
        }
        info!("Scan {:?} stopped", self.handle);
    }

    // Returns true when the reading belongs to the session beacon
    async fn handle_reading(&mut self, reading: BeaconReading) -> bool {
        let estimate = estimate(&reading, &self.config);
        let rssi = reading.rssi;
        let is_target = reading.beacon_id == self.target;
        trace!(
            "Beacon {} rssi {} -> {:.2}m (in range: {})",
            reading.beacon_id, rssi, estimate.distance_meters, estimate.in_range
        );

        self.buffer.lock().await.record(reading);

        let input = if estimate.in_range { ScanInput::InRange } else { ScanInput::OutOfRange };
        self.emit(ProximityEvent::Estimate {
            estimate,
            rssi,
            strength: SignalStrength::from_rssi(rssi),
        });
        if is_target {
            self.advance(input);
        }
        is_target
    }

    fn advance(&mut self, input: ScanInput) {
        let from = *self.state.borrow();
        let to = from.next(input);
        if from != to {
            debug!("Scan {:?}: {:?} -> {:?} on {:?}", self.handle, from, to, input);
            self.state.send_replace(to);
            self.emit(ProximityEvent::StateChanged { from, to });
        }
    }

    // Never blocks the scan loop on a slow consumer; the buffer and the
    // state channel still hold the latest values.
    fn emit(&self, event: ProximityEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Event channel full for scan {:?}, dropping event", self.handle),
            Err(TrySendError::Closed(_)) => trace!("No listener for scan {:?} events", self.handle),
        }
    }
}

/// A running scan. Dropping it cancels the scan; `stop` also waits until
/// the radio has been released.
pub struct ScanSession {
    beacon_id: BeaconId,
    config: ProximityConfig,
    events: mpsc::Receiver<ProximityEvent>,
    state: watch::Receiver<ConnectionState>,
    buffer: Arc<Mutex<ReadingBuffer>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch handle for connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Next event, or `None` once the scan has stopped and the queue is drained.
    pub async fn next_event(&mut self) -> Option<ProximityEvent> {
        self.events.recv().await
    }

    pub async fn latest(&self, beacon_id: &str) -> Option<BeaconReading> {
        self.buffer.lock().await.latest(beacon_id).cloned()
    }

    /// Estimate for the session beacon's most recent reading.
    pub async fn latest_estimate(&self) -> Option<ProximityEstimate> {
        self.latest(&self.beacon_id)
            .await
            .map(|reading| estimate(&reading, &self.config))
    }

    /// Waits until the session beacon is connected and in range.
    pub async fn wait_for_in_range(&self, timeout: Duration) -> Result<ProximityEstimate, ProximityError> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                state
                    .wait_for(|s| *s == ConnectionState::Connected)
                    .await
                    .map(|_| ())
                    .map_err(|_| ProximityError::ScanEnded)?;
                if let Some(est) = self.latest_estimate().await {
                    if est.in_range {
                        return Ok(est);
                    }
                }
                // Moved on before the buffer was read, wait for the next change
                state.changed().await.map_err(|_| ProximityError::ScanEnded)?;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ProximityError::Timeout { after: timeout }),
        }
    }

    /// Stops scanning and returns once the radio scan has been released.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Scan task for beacon {} ended abnormally: {}", self.beacon_id, e);
            }
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::sources::ManualRadio;

    fn fast_config() -> ProximityConfig {
        ProximityConfig {
            scan_interval: Duration::from_millis(20),
            staleness_window: Duration::from_millis(40),
            ..ProximityConfig::default()
        }
    }

    #[tokio::test]
    async fn denied_permission_is_sticky_until_rerequested() {
        let radio = Arc::new(ManualRadio::new(false));
        let monitor = ProximityMonitor::new(radio.clone(), fast_config());

        assert_eq!(monitor.start("beacon_001").await.err(), Some(ProximityError::PermissionDenied));
        assert_eq!(radio.permission_requests(), 1);

        // Second start must not silently re-ask
        assert_eq!(monitor.start("beacon_001").await.err(), Some(ProximityError::PermissionDenied));
        assert_eq!(radio.permission_requests(), 1);
        assert_eq!(radio.scans_started(), 0);

        radio.set_permission(true);
        monitor.request_permission().await.unwrap();
        let session = monitor.start("beacon_001").await.unwrap();
        assert_eq!(session.state(), ConnectionState::Scanning);
        session.stop().await;
    }

    #[tokio::test]
    async fn in_range_reading_connects() {
        let radio = Arc::new(ManualRadio::new(true));
        let monitor = ProximityMonitor::new(radio.clone(), fast_config());
        let mut session = monitor.start("beacon_001").await.unwrap();

        assert_eq!(
            session.next_event().await,
            Some(ProximityEvent::StateChanged {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Scanning,
            })
        );

        radio.emit(BeaconReading::new("beacon_001", -45)).await;
        let est = session.wait_for_in_range(Duration::from_secs(1)).await.unwrap();
        assert!(est.in_range);
        assert_eq!(session.state(), ConnectionState::Connected);

        session.stop().await;
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn other_beacons_do_not_connect() {
        let radio = Arc::new(ManualRadio::new(true));
        let monitor = ProximityMonitor::new(radio.clone(), fast_config());
        let session = monitor.start("beacon_001").await.unwrap();

        radio.emit(BeaconReading::new("beacon_999", -40)).await;
        let err = session.wait_for_in_range(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, ProximityError::Timeout { after: Duration::from_millis(100) });
        assert!(session.latest("beacon_999").await.is_some());
        assert_eq!(session.state(), ConnectionState::Scanning);
        session.stop().await;
    }

    #[tokio::test]
    async fn stale_beacon_disconnects() {
        let radio = Arc::new(ManualRadio::new(true));
        let monitor = ProximityMonitor::new(radio.clone(), fast_config());
        let session = monitor.start("beacon_001").await.unwrap();
        let mut state = session.subscribe_state();

        radio.emit(BeaconReading::new("beacon_001", -50)).await;
        session.wait_for_in_range(Duration::from_secs(1)).await.unwrap();

        // No further readings: staleness window elapses
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .expect("should go stale")
        .unwrap();

        // Reacquire while still scanning
        radio.emit(BeaconReading::new("beacon_001", -50)).await;
        session.wait_for_in_range(Duration::from_secs(1)).await.unwrap();
        session.stop().await;
    }

    #[tokio::test]
    async fn dropping_the_session_releases_the_radio() {
        let radio = Arc::new(ManualRadio::new(true));
        let monitor = ProximityMonitor::new(radio.clone(), fast_config());
        let session = monitor.start("beacon_001").await.unwrap();
        assert_eq!(radio.active_scans(), 1);
        drop(session);

        let deadline = Instant::now() + Duration::from_secs(1);
        while radio.active_scans() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(radio.active_scans(), 0);
    }
}
