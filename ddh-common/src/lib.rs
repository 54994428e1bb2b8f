//! Shared types and utilities for Disk Device Health.
//!
//! Holds the typed telemetry records exchanged between the telemetry sources
//! and the monitor daemon, the runtime monitor policy, and logging setup.

pub mod logging;
pub mod testing;
pub mod types;

pub use logging::{LogOptions, LoggingGuard, init_logging};
pub use types::{
    DedupScope, DedupStats, DeviceHealth, DeviceId, DeviceState, DiskGroupMapping,
    EvacuationEvent, HealthFlags, IoLatencyStats, LatencyStats, LogPositions, MonitorConfig,
    PrepareLatency, PrepareOp, ReclaimState, SmartCounters, Tier,
};
