//! Multi-factor presence verification for classroom attendance.
//!
//! Two independent signals, beacon proximity and face verification with
//! liveness checks, are fused into one attendance record per student per
//! session.

pub mod biometric;
pub mod checkin;
pub mod config;
pub mod data_structures;
pub mod fusion;
pub mod interface;
pub mod proximity;
pub mod simulation;

pub mod test_utils; // Shared test utilities, also used by tests/

pub use checkin::{CheckInCoordinator, CheckInError};
pub use config::SystemConfig;
pub use fusion::{AuditLog, FusionEngine};
