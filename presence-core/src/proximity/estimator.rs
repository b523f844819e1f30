use std::collections::VecDeque;

use crate::config::{ProximityConfig, READING_BUFFER_CAPACITY};
use crate::proximity::types::{BeaconReading, ProximityEstimate};

/// Log-distance path loss model:
/// `distance = 10 ^ ((tx_power - rssi) / (10 * n))`.
///
/// Strictly decreasing in `rssi` for any positive `path_loss_exponent`.
pub fn distance_meters(rssi: i32, tx_power: f64, path_loss_exponent: f64) -> f64 {
    10f64.powf((tx_power - f64::from(rssi)) / (10.0 * path_loss_exponent))
}

/// Pure estimate for a single reading. No smoothing: the same reading and
/// config always give the same answer, however noisy the radio is.
pub fn estimate(reading: &BeaconReading, config: &ProximityConfig) -> ProximityEstimate {
    let distance = distance_meters(reading.rssi, config.tx_power, config.path_loss_exponent);
    ProximityEstimate {
        beacon_id: reading.beacon_id.clone(),
        distance_meters: distance,
        in_range: distance <= config.range_threshold_meters,
    }
}

/// Latest reading per beacon, bounded to a fixed number of beacons.
/// A newer reading replaces the older one outright; nothing is averaged.
#[derive(Debug, Clone)]
pub struct ReadingBuffer {
    capacity: usize,
    // Least recently updated beacon at the front
    readings: VecDeque<BeaconReading>,
}

impl Default for ReadingBuffer {
    fn default() -> Self {
        ReadingBuffer::with_capacity(READING_BUFFER_CAPACITY)
    }
}

impl ReadingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ReadingBuffer {
            capacity: capacity.max(1),
            readings: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, reading: BeaconReading) {
        if let Some(pos) = self.readings.iter().position(|r| r.beacon_id == reading.beacon_id) {
            self.readings.remove(pos);
        }
        self.readings.push_back(reading);
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
    }

    pub fn latest(&self, beacon_id: &str) -> Option<&BeaconReading> {
        self.readings.iter().find(|r| r.beacon_id == beacon_id)
    }
}
