// presence-core/src/test_utils.rs
// Shared helpers for unit and scenario tests

use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::biometric::types::{CheckVerdict, FaceEmbedding, LivenessChecks, VerificationOutcome};
use crate::config::{BiometricConfig, ProximityConfig, EMBEDDING_DIMENSIONS};
use crate::data_structures::StudentId;
use crate::proximity::types::ProximityEstimate;

/// Proximity config with millisecond-scale scan and staleness timings.
pub fn fast_proximity_config() -> ProximityConfig {
    ProximityConfig {
        scan_interval: Duration::from_millis(20),
        staleness_window: Duration::from_millis(40),
        ..ProximityConfig::default()
    }
}

/// Biometric config with a near-zero liveness window and a generous stage timeout.
pub fn fast_biometric_config() -> BiometricConfig {
    BiometricConfig {
        liveness_check_window: Duration::from_millis(2),
        stage_timeout: Duration::from_secs(2),
        ..BiometricConfig::default()
    }
}

/// Deterministic embedding; the same seed always yields the same vector.
pub fn test_embedding(seed: u64) -> FaceEmbedding {
    let mut rng = SmallRng::seed_from_u64(seed);
    let vector = (0..EMBEDDING_DIMENSIONS).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    FaceEmbedding::new(vector, 0.95, Utc::now()).expect("generated embedding is valid")
}

/// Embedding whose cosine similarity to `base` is exactly `similarity`
/// (up to float rounding), for `similarity` in [0, 1].
pub fn embedding_with_similarity(base: &FaceEmbedding, similarity: f64, seed: u64) -> FaceEmbedding {
    let a: Vec<f64> = base.vector().iter().map(|v| f64::from(*v)).collect();
    let norm_a = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let unit_a: Vec<f64> = a.iter().map(|v| v / norm_a).collect();

    // Random direction made orthogonal to `base`
    let mut rng = SmallRng::seed_from_u64(seed);
    let raw: Vec<f64> = (0..a.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let dot: f64 = raw.iter().zip(&unit_a).map(|(r, u)| r * u).sum();
    let ortho: Vec<f64> = raw.iter().zip(&unit_a).map(|(r, u)| r - dot * u).collect();
    let norm_o = ortho.iter().map(|v| v * v).sum::<f64>().sqrt();

    let sine = (1.0 - similarity * similarity).max(0.0).sqrt();
    let vector = unit_a
        .iter()
        .zip(&ortho)
        .map(|(u, o)| (similarity * u + sine * o / norm_o) as f32)
        .collect();
    FaceEmbedding::new(vector, 0.95, Utc::now()).expect("constructed embedding is valid")
}

pub fn in_range_estimate(beacon_id: &str) -> ProximityEstimate {
    ProximityEstimate {
        beacon_id: beacon_id.to_string(),
        distance_meters: 5.01,
        in_range: true,
    }
}

pub fn out_of_range_estimate(beacon_id: &str) -> ProximityEstimate {
    ProximityEstimate {
        beacon_id: beacon_id.to_string(),
        distance_meters: 63.1,
        in_range: false,
    }
}

pub fn live_checks() -> LivenessChecks {
    LivenessChecks::from_verdicts(CheckVerdict::pass(0.9), CheckVerdict::pass(0.9), CheckVerdict::pass(0.9))
}

/// A verified face outcome as the pipeline would produce it (scenario B numbers).
pub fn verified_outcome() -> VerificationOutcome {
    VerificationOutcome {
        verified: true,
        confidence: 0.75,
        similarity: 0.75,
        liveness: live_checks(),
        embedding: Some(test_embedding(1)),
    }
}

pub fn roster(size: usize) -> Vec<StudentId> {
    (1..=size).map(|i| format!("S{}", i)).collect()
}
