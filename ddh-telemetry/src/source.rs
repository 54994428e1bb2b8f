//! The read-only telemetry interface consumed by the monitor.

use crate::TelemetryError;
use async_trait::async_trait;
use ddh_common::{
    DedupStats, DeviceHealth, DeviceId, DeviceState, DiskGroupMapping, LatencyStats,
    LogPositions, MonitorConfig, PrepareLatency, SmartCounters, Tier,
};

/// Named telemetry queries. The name doubles as the probe sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    ListDevices,
    DedupMappings,
    LatencyStats,
    CongestionScore,
    Health,
    DeviceState,
    SmartCounters,
    LogPositions,
    PrepareLatency,
    DedupStats,
    ReclaimComplete,
    HostIsVirtualMachine,
    Config,
}

impl Query {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListDevices => "list_devices",
            Self::DedupMappings => "dedup_mappings",
            Self::LatencyStats => "latency_stats",
            Self::CongestionScore => "congestion_score",
            Self::Health => "health",
            Self::DeviceState => "device_state",
            Self::SmartCounters => "smart_counters",
            Self::LogPositions => "log_positions",
            Self::PrepareLatency => "prepare_latency",
            Self::DedupStats => "dedup_stats",
            Self::ReclaimComplete => "reclaim_complete",
            Self::HostIsVirtualMachine => "host_is_virtual_machine",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed, read-only view of device and host state.
///
/// Implementations must be cheap to share across tasks; congestion watches
/// call [`TelemetrySource::congestion_score`] concurrently with the main loop.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Devices currently claimed by the pool in `tier`.
    async fn list_devices(&self, tier: Tier) -> Result<Vec<DeviceId>, TelemetryError>;

    /// Dedup disk groups (caching owner plus its capacity devices).
    async fn dedup_mappings(&self) -> Result<Vec<DiskGroupMapping>, TelemetryError>;

    async fn latency_stats(&self, device: &DeviceId) -> Result<LatencyStats, TelemetryError>;

    /// Normalized congestion score in `0..=256`.
    async fn congestion_score(&self, device: &DeviceId) -> Result<u32, TelemetryError>;

    async fn health(&self, device: &DeviceId) -> Result<DeviceHealth, TelemetryError>;

    async fn device_state(&self, device: &DeviceId) -> Result<DeviceState, TelemetryError>;

    async fn smart_counters(&self, device: &DeviceId) -> Result<SmartCounters, TelemetryError>;

    async fn log_positions(&self, device: &DeviceId) -> Result<LogPositions, TelemetryError>;

    async fn prepare_latency(&self, device: &DeviceId) -> Result<PrepareLatency, TelemetryError>;

    async fn dedup_stats(&self, device: &DeviceId) -> Result<DedupStats, TelemetryError>;

    /// Whether the dedup space reclaim scan finished on `device`.
    async fn reclaim_complete(&self, device: &DeviceId) -> Result<bool, TelemetryError>;

    async fn host_is_virtual_machine(&self) -> Result<bool, TelemetryError>;

    /// Current monitor policy. Read once per monitor cycle.
    async fn config(&self) -> Result<MonitorConfig, TelemetryError>;
}
