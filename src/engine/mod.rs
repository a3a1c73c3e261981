//! The reliability engine and the records it keeps per peer and per exchange.

pub mod ordering;
pub mod pending_delete;
pub mod records;
pub mod reliability_engine;

pub use reliability_engine::{MaintenanceTask, ReliabilityEngine, SendOptions};
