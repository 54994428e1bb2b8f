//! Core types shared by the telemetry sources and the monitor daemon.

use serde::{Deserialize, Serialize};

/// Stable device name as reported by the storage stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Storage tier a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier-1 caching device (write buffer and read cache of a disk group).
    Caching,
    /// Tier-2 capacity device (persistent data).
    Capacity,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Caching, Tier::Capacity];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Caching => "caching",
            Self::Capacity => "capacity",
        };
        write!(f, "{value}")
    }
}

/// Raw device health bits reported by the storage stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthFlags(pub u32);

impl HealthFlags {
    pub const FAILED: u32 = 16;
    pub const EVACUATING: u32 = 256;
    pub const EVACUATION_FAILED: u32 = 512;
    pub const EVACUATION_INACCESSIBLE: u32 = 1024;
    pub const EVACUATED: u32 = 2048;

    const UNHEALTHY_MASK: u32 = Self::EVACUATING
        | Self::EVACUATION_FAILED
        | Self::EVACUATION_INACCESSIBLE
        | Self::EVACUATED;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    pub fn is_failed(self) -> bool {
        self.contains(Self::FAILED)
    }

    /// Device is being (or has been) evacuated and must not be diagnosed.
    pub fn is_evacuation_state(self) -> bool {
        self.0 & Self::UNHEALTHY_MASK != 0
    }
}

/// Mount status plus health bits for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceHealth {
    /// Device is mounted into the pool. Unmounted devices carry no flags.
    pub mounted: bool,
    pub flags: HealthFlags,
}

impl DeviceHealth {
    pub fn unmounted() -> Self {
        Self {
            mounted: false,
            flags: HealthFlags::default(),
        }
    }

    pub fn mounted(flags: u32) -> Self {
        Self {
            mounted: true,
            flags: HealthFlags(flags),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.mounted && self.flags.is_failed()
    }

    /// Mounted and not in an evacuation state.
    pub fn is_monitorable(&self) -> bool {
        self.mounted && !self.flags.is_evacuation_state()
    }

    /// Mounted and not failed.
    pub fn is_serving(&self) -> bool {
        self.mounted && !self.flags.is_failed()
    }
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.mounted {
            return write!(f, "unmounted");
        }
        let value = if self.flags.is_failed() {
            "failed"
        } else if self.flags.contains(HealthFlags::EVACUATED) {
            "evacuated"
        } else if self.flags.contains(HealthFlags::EVACUATION_INACCESSIBLE) {
            "evacuation_inaccessible"
        } else if self.flags.contains(HealthFlags::EVACUATION_FAILED) {
            "evacuation_failed"
        } else if self.flags.contains(HealthFlags::EVACUATING) {
            "evacuating"
        } else {
            "healthy"
        };
        write!(f, "{value}")
    }
}

/// Dedup scope of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    #[default]
    None,
    DiskGroup,
}

/// Host-wide dedup space reclamation state. Transitions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimState {
    #[default]
    Disabled,
    Enabled,
    Complete,
}

impl ReclaimState {
    /// Numeric value understood by the host configuration store.
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Enabled => 1,
            Self::Complete => 2,
        }
    }
}

impl std::fmt::Display for ReclaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Complete => "complete",
        };
        write!(f, "{value}")
    }
}

/// Latency statistics of one IO direction over the last interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoLatencyStats {
    /// Highest moving-average latency observed in the interval.
    pub max_average_latency_us: u64,
    /// Configured latency threshold.
    pub threshold_us: u64,
    /// Number of moving-average samples above the threshold.
    pub threshold_exceeded_count: u32,
    /// Number of samples with enough IO to be judged.
    pub minimum_ios_exceeded_count: u32,
}

impl IoLatencyStats {
    pub fn exceeded(&self) -> bool {
        self.threshold_exceeded_count > 0
    }

    pub fn has_sufficient_io(&self) -> bool {
        self.minimum_ios_exceeded_count > 0
    }

    pub fn half_threshold_us(&self) -> u64 {
        self.threshold_us / 2
    }
}

/// Read/write latency statistics for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LatencyStats {
    pub read: IoLatencyStats,
    pub write: IoLatencyStats,
    /// Width of the moving-average window used by the storage stack.
    pub moving_average_interval_secs: u64,
}

/// SMART counters surfaced for advisory warnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmartCounters {
    pub uncorrectable_sectors: u64,
    pub reported_uncorrectable_errors: u64,
    pub reallocated_sectors: u64,
    pub reallocation_events: u64,
    pub pending_reallocations: u64,
    pub command_timeouts: u64,
}

impl SmartCounters {
    pub fn any_nonzero(&self) -> bool {
        self.uncorrectable_sectors > 0
            || self.reported_uncorrectable_errors > 0
            || self.reallocated_sectors > 0
            || self.reallocation_events > 0
            || self.pending_reallocations > 0
            || self.command_timeouts > 0
    }
}

/// Log start positions and log congestion for a caching device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPositions {
    pub plog_start: u64,
    pub llog_start: u64,
    /// Log congestion, 0..=256.
    pub congestion: u32,
}

/// Prepare latency of one operation class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareOp {
    pub average_latency_us: u64,
    pub iops: u64,
    pub threshold_us: u64,
}

/// Log prepare latency of a caching device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareLatency {
    pub read: PrepareOp,
    pub write: PrepareOp,
    pub unmap: PrepareOp,
}

impl PrepareLatency {
    pub fn ops(&self) -> [(&'static str, &PrepareOp); 3] {
        [
            ("read", &self.read),
            ("write", &self.write),
            ("unmap", &self.unmap),
        ]
    }
}

/// Dedup statistics of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupStats {
    pub scope: DedupScope,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DedupStats {
    /// Used capacity as a fraction in `0.0..=1.0`; zero when the size is unknown.
    pub fn used_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Static properties of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceState {
    /// Disk group made only of flash devices.
    pub all_flash: bool,
    /// Caching layer reports the device as operational.
    pub state_ok: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            all_flash: false,
            state_ok: true,
        }
    }
}

/// A dedup disk group: one caching device owning its capacity devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskGroupMapping {
    pub caching: DeviceId,
    pub capacity: Vec<DeviceId>,
}

/// Evacuation event codes understood by the storage stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvacuationEvent {
    /// Capacity device unhealthy.
    CapacityUnhealthy,
    /// Caching device unhealthy; evacuates the whole disk group.
    CachingUnhealthy,
    /// Disk group log stuck at maximum congestion.
    DiskGroupLogCongested,
}

impl EvacuationEvent {
    pub fn code(self) -> u32 {
        match self {
            Self::CapacityUnhealthy => 10,
            Self::CachingUnhealthy => 11,
            Self::DiskGroupLogCongested => 12,
        }
    }
}

impl std::fmt::Display for EvacuationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::CapacityUnhealthy => "capacity_unhealthy",
            Self::CachingUnhealthy => "caching_unhealthy",
            Self::DiskGroupLogCongested => "disk_group_log_congested",
        };
        write!(f, "{value}")
    }
}

/// Default poll interval between monitor scans.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Monitor policy read from the host configuration store every cycle.
///
/// A decoded policy must carry every field; `Default` is for code-built ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Evacuate devices whose write latency keeps exceeding the threshold.
    pub pull_the_plug: bool,
    /// Also evacuate unmapped caching devices on latency verdicts.
    pub pull_the_plug_on_tier1: bool,
    /// Try to remount devices that report a failed state.
    pub remount_after_failed: bool,
    /// Window after the first failure during which remounts are attempted.
    pub remount_window_secs: u64,
    /// Exceeded sampled intervals required per period before evacuation.
    pub latency_interval_count: u32,
    /// Length of one latency sampling period.
    pub latency_time_period_mins: u32,
    pub log_congestion_diagnosis: bool,
    /// Consecutive congested cycles without log progress before evacuation.
    pub log_congestion_interval_count: u32,
    pub prepare_latency_diagnosis: bool,
    /// Consecutive slow prepare cycles before evacuation.
    pub prepare_latency_interval_count: u32,
    pub poll_interval_secs: u64,
    pub device_monitoring_enabled: bool,
    /// Run the monitor when the host itself is a virtual machine.
    pub monitor_in_vm_enabled: bool,
    pub dedup_space_reclaim: ReclaimState,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pull_the_plug: true,
            pull_the_plug_on_tier1: false,
            remount_after_failed: true,
            remount_window_secs: 24 * 60 * 60,
            latency_interval_count: 5,
            latency_time_period_mins: 240,
            log_congestion_diagnosis: true,
            log_congestion_interval_count: 3,
            prepare_latency_diagnosis: true,
            prepare_latency_interval_count: 3,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            device_monitoring_enabled: true,
            monitor_in_vm_enabled: false,
            dedup_space_reclaim: ReclaimState::Disabled,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_flags_classify_evacuation_states() {
        assert!(!HealthFlags(0).is_evacuation_state());
        assert!(!HealthFlags(HealthFlags::FAILED).is_evacuation_state());
        assert!(HealthFlags(HealthFlags::EVACUATING).is_evacuation_state());
        assert!(HealthFlags(HealthFlags::EVACUATED | HealthFlags::FAILED).is_evacuation_state());
        assert!(HealthFlags(HealthFlags::FAILED | 1).is_failed());
    }

    #[test]
    fn unmounted_device_is_neither_failed_nor_serving() {
        let health = DeviceHealth::unmounted();
        assert!(!health.is_failed());
        assert!(!health.is_serving());
        assert!(!health.is_monitorable());
        assert_eq!(health.to_string(), "unmounted");
    }

    #[test]
    fn failed_device_is_still_monitorable() {
        let health = DeviceHealth::mounted(HealthFlags::FAILED);
        assert!(health.is_failed());
        assert!(health.is_monitorable());
        assert!(!health.is_serving());
        assert_eq!(health.to_string(), "failed");
    }

    #[test]
    fn evacuation_event_codes_are_stable() {
        assert_eq!(EvacuationEvent::CapacityUnhealthy.code(), 10);
        assert_eq!(EvacuationEvent::CachingUnhealthy.code(), 11);
        assert_eq!(EvacuationEvent::DiskGroupLogCongested.code(), 12);
    }

    #[test]
    fn reclaim_state_orders_as_a_ratchet() {
        assert!(ReclaimState::Disabled < ReclaimState::Enabled);
        assert!(ReclaimState::Enabled < ReclaimState::Complete);
        assert_eq!(ReclaimState::Complete.as_raw(), 2);
    }

    #[test]
    fn dedup_used_ratio_handles_unknown_size() {
        let stats = DedupStats::default();
        assert_eq!(stats.used_ratio(), 0.0);
        let stats = DedupStats {
            scope: DedupScope::DiskGroup,
            total_bytes: 1000,
            used_bytes: 300,
        };
        assert!((stats.used_ratio() - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn monitor_config_fills_missing_fields_with_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"poll_interval_secs": 60, "pull_the_plug": false}"#)
                .expect("parse");
        assert_eq!(config.poll_interval_secs, 60);
        assert!(!config.pull_the_plug);
        assert_eq!(config.latency_interval_count, 5);
        assert_eq!(config.dedup_space_reclaim, ReclaimState::Disabled);
    }

    #[test]
    fn smart_counters_detect_any_nonzero_field() {
        assert!(!SmartCounters::default().any_nonzero());
        let counters = SmartCounters {
            command_timeouts: 1,
            ..Default::default()
        };
        assert!(counters.any_nonzero());
    }
}
