// Types for beacon proximity estimation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::data_structures::BeaconId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeaconReading {
    pub beacon_id: BeaconId,
    pub rssi: i32, // dBm, more negative is weaker
    pub observed_at: DateTime<Utc>,
}

impl BeaconReading {
    pub fn new(beacon_id: &str, rssi: i32) -> Self {
        BeaconReading {
            beacon_id: beacon_id.to_string(),
            rssi,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProximityEstimate {
    pub beacon_id: BeaconId,
    pub distance_meters: f64,
    pub in_range: bool,
}

// Coarse signal quality buckets shown next to a beacon
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStrength {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl SignalStrength {
    pub fn from_rssi(rssi: i32) -> Self {
        match rssi {
            r if r >= -50 => SignalStrength::Excellent,
            r if r >= -60 => SignalStrength::Good,
            r if r >= -70 => SignalStrength::Fair,
            r if r >= -80 => SignalStrength::Poor,
            _ => SignalStrength::VeryPoor,
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            SignalStrength::Excellent => 100,
            SignalStrength::Good => 75,
            SignalStrength::Fair => 50,
            SignalStrength::Poor => 25,
            SignalStrength::VeryPoor => 10,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignalStrength::Excellent => "Excellent",
            SignalStrength::Good => "Good",
            SignalStrength::Fair => "Fair",
            SignalStrength::Poor => "Poor",
            SignalStrength::VeryPoor => "Very Poor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connected,
}

// Inputs driving the connection state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanInput {
    ScanStarted,
    InRange,    // Reading for the session beacon, within range
    OutOfRange, // Reading for the session beacon, too far away
    Stale,      // No reading for the session beacon within the staleness window
    ScanStopped,
}

impl ConnectionState {
    /// Next state for `input`. Readings for other beacons never reach here.
    pub fn next(self, input: ScanInput) -> ConnectionState {
        use ConnectionState::*;
        match (self, input) {
            (_, ScanInput::ScanStopped) => Disconnected,
            (Disconnected, ScanInput::ScanStarted) => Scanning,
            (Scanning, ScanInput::InRange) => Connected,
            // Reacquired after a staleness drop while the scan is still running
            (Disconnected, ScanInput::InRange) => Connected,
            (Connected, ScanInput::OutOfRange) => Scanning,
            (Connected, ScanInput::Stale) => Disconnected,
            (state, _) => state,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProximityEvent {
    Estimate {
        estimate: ProximityEstimate,
        rssi: i32,
        strength: SignalStrength,
    },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ProximityError {
    #[error("radio permission denied; request permission again before scanning")]
    PermissionDenied,
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("beacon not in range within {after:?}")]
    Timeout { after: Duration },
    #[error("scan ended before the beacon came into range")]
    ScanEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_strength_buckets() {
        assert_eq!(SignalStrength::from_rssi(-45), SignalStrength::Excellent);
        assert_eq!(SignalStrength::from_rssi(-50), SignalStrength::Excellent);
        assert_eq!(SignalStrength::from_rssi(-55), SignalStrength::Good);
        assert_eq!(SignalStrength::from_rssi(-70), SignalStrength::Fair);
        assert_eq!(SignalStrength::from_rssi(-79), SignalStrength::Poor);
        assert_eq!(SignalStrength::from_rssi(-95), SignalStrength::VeryPoor);
        assert_eq!(SignalStrength::VeryPoor.percent(), 10);
        assert_eq!(SignalStrength::Poor.label(), "Poor");
    }

    #[test]
    fn connection_state_happy_path() {
        let state = ConnectionState::Disconnected
            .next(ScanInput::ScanStarted)
            .next(ScanInput::InRange);
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(state.next(ScanInput::Stale), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_state_ignores_irrelevant_inputs() {
        // Staleness only matters once connected
        assert_eq!(ConnectionState::Scanning.next(ScanInput::Stale), ConnectionState::Scanning);
        assert_eq!(ConnectionState::Scanning.next(ScanInput::OutOfRange), ConnectionState::Scanning);
        // A scan can't start twice
        assert_eq!(ConnectionState::Connected.next(ScanInput::ScanStarted), ConnectionState::Connected);
    }

    #[test]
    fn stop_always_disconnects() {
        for state in [ConnectionState::Disconnected, ConnectionState::Scanning, ConnectionState::Connected] {
            assert_eq!(state.next(ScanInput::ScanStopped), ConnectionState::Disconnected);
        }
    }

    #[test]
    fn out_of_range_reading_drops_back_to_scanning() {
        assert_eq!(ConnectionState::Connected.next(ScanInput::OutOfRange), ConnectionState::Scanning);
    }
}
