// Presence fusion: the per-session attendance ledger and its audit trail

pub mod audit;
pub mod engine;
pub mod types;

pub use audit::AuditLog;
pub use engine::FusionEngine;
pub use types::{AuditAction, AuditEvent, FusionError, SessionSummary};
