// Beacon proximity: RSSI to distance, and the scan-session state machine

pub mod estimator;
pub mod monitor;
pub mod types;

// Re-export key types
pub use estimator::{distance_meters, estimate, ReadingBuffer};
pub use monitor::{ProximityMonitor, ScanSession};
pub use types::{
    BeaconReading, ConnectionState, ProximityError, ProximityEstimate, ProximityEvent, ScanInput,
    SignalStrength,
};
