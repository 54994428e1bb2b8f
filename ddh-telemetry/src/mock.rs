//! In-memory telemetry for tests and dry runs.
//!
//! Devices added with [`MockTelemetry::add_device`] start mounted and healthy
//! with quiet statistics; tests then adjust individual records. Queries for
//! unknown devices, or devices marked with [`MockTelemetry::fail_device`],
//! return [`TelemetryError::Unavailable`].

use crate::{Query, TelemetryError, TelemetrySource};
use async_trait::async_trait;
use ddh_common::{
    DedupStats, DeviceHealth, DeviceId, DeviceState, DiskGroupMapping, LatencyStats,
    LogPositions, MonitorConfig, PrepareLatency, SmartCounters, Tier,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
struct MockDevice {
    tier: Option<Tier>,
    listed: bool,
    health: DeviceHealth,
    latency: LatencyStats,
    congestion: u32,
    state: DeviceState,
    smart: SmartCounters,
    log: LogPositions,
    prepare: PrepareLatency,
    dedup: DedupStats,
    reclaim_complete: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<DeviceId, MockDevice>,
    order: Vec<DeviceId>,
    mappings: Vec<DiskGroupMapping>,
    config: MonitorConfig,
    virtual_machine: bool,
    failing: HashSet<DeviceId>,
    config_unavailable: bool,
    congestion_reads: HashMap<DeviceId, usize>,
}

/// Programmable [`TelemetrySource`].
#[derive(Debug, Default)]
pub struct MockTelemetry {
    state: Mutex<MockState>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listed, mounted, healthy device.
    pub fn add_device(&self, id: impl Into<DeviceId>, tier: Tier) {
        let id = id.into();
        let mut state = self.state.lock();
        if !state.devices.contains_key(&id) {
            state.order.push(id.clone());
        }
        state.devices.insert(
            id,
            MockDevice {
                tier: Some(tier),
                listed: true,
                health: DeviceHealth::mounted(0),
                ..Default::default()
            },
        );
    }

    /// Stop listing a device while keeping its records readable.
    pub fn unlist_device(&self, id: &DeviceId) {
        if let Some(device) = self.state.lock().devices.get_mut(id) {
            device.listed = false;
        }
    }

    /// Make every per-device query for `id` fail until [`Self::restore_device`].
    pub fn fail_device(&self, id: &DeviceId) {
        self.state.lock().failing.insert(id.clone());
    }

    pub fn restore_device(&self, id: &DeviceId) {
        self.state.lock().failing.remove(id);
    }

    pub fn set_config_unavailable(&self, unavailable: bool) {
        self.state.lock().config_unavailable = unavailable;
    }

    pub fn set_config(&self, config: MonitorConfig) {
        self.state.lock().config = config;
    }

    pub fn update_config(&self, update: impl FnOnce(&mut MonitorConfig)) {
        update(&mut self.state.lock().config);
    }

    pub fn set_virtual_machine(&self, virtual_machine: bool) {
        self.state.lock().virtual_machine = virtual_machine;
    }

    pub fn set_mappings(&self, mappings: Vec<DiskGroupMapping>) {
        self.state.lock().mappings = mappings;
    }

    pub fn set_health(&self, id: &DeviceId, health: DeviceHealth) {
        self.with_device(id, |d| d.health = health);
    }

    pub fn set_latency(&self, id: &DeviceId, latency: LatencyStats) {
        self.with_device(id, |d| d.latency = latency);
    }

    pub fn set_congestion(&self, id: &DeviceId, score: u32) {
        self.with_device(id, |d| d.congestion = score);
    }

    pub fn set_device_state(&self, id: &DeviceId, device_state: DeviceState) {
        self.with_device(id, |d| d.state = device_state);
    }

    pub fn set_smart(&self, id: &DeviceId, smart: SmartCounters) {
        self.with_device(id, |d| d.smart = smart);
    }

    pub fn set_log_positions(&self, id: &DeviceId, log: LogPositions) {
        self.with_device(id, |d| d.log = log);
    }

    pub fn set_prepare_latency(&self, id: &DeviceId, prepare: PrepareLatency) {
        self.with_device(id, |d| d.prepare = prepare);
    }

    pub fn set_dedup_stats(&self, id: &DeviceId, dedup: DedupStats) {
        self.with_device(id, |d| d.dedup = dedup);
    }

    pub fn set_reclaim_complete(&self, id: &DeviceId, complete: bool) {
        self.with_device(id, |d| d.reclaim_complete = complete);
    }

    /// Current health record, for assertions and host mocks.
    pub fn health_of(&self, id: &DeviceId) -> Option<DeviceHealth> {
        self.state.lock().devices.get(id).map(|d| d.health)
    }

    /// Number of congestion samples taken for `id`.
    pub fn congestion_reads(&self, id: &DeviceId) -> usize {
        self.state
            .lock()
            .congestion_reads
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn with_device(&self, id: &DeviceId, update: impl FnOnce(&mut MockDevice)) {
        let mut state = self.state.lock();
        if !state.devices.contains_key(id) {
            state.order.push(id.clone());
        }
        update(state.devices.entry(id.clone()).or_default());
    }

    fn read<T>(
        &self,
        query: Query,
        id: &DeviceId,
        select: impl FnOnce(&MockDevice) -> T,
    ) -> Result<T, TelemetryError> {
        let state = self.state.lock();
        if state.failing.contains(id) {
            return Err(TelemetryError::unavailable(query.as_str(), Some(id)));
        }
        state
            .devices
            .get(id)
            .map(select)
            .ok_or_else(|| TelemetryError::unavailable(query.as_str(), Some(id)))
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetry {
    async fn list_devices(&self, tier: Tier) -> Result<Vec<DeviceId>, TelemetryError> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter(|id| {
                state
                    .devices
                    .get(*id)
                    .is_some_and(|d| d.listed && d.tier == Some(tier))
            })
            .cloned()
            .collect())
    }

    async fn dedup_mappings(&self) -> Result<Vec<DiskGroupMapping>, TelemetryError> {
        Ok(self.state.lock().mappings.clone())
    }

    async fn latency_stats(&self, device: &DeviceId) -> Result<LatencyStats, TelemetryError> {
        self.read(Query::LatencyStats, device, |d| d.latency)
    }

    async fn congestion_score(&self, device: &DeviceId) -> Result<u32, TelemetryError> {
        let score = self.read(Query::CongestionScore, device, |d| d.congestion);
        *self
            .state
            .lock()
            .congestion_reads
            .entry(device.clone())
            .or_default() += 1;
        score
    }

    async fn health(&self, device: &DeviceId) -> Result<DeviceHealth, TelemetryError> {
        self.read(Query::Health, device, |d| d.health)
    }

    async fn device_state(&self, device: &DeviceId) -> Result<DeviceState, TelemetryError> {
        self.read(Query::DeviceState, device, |d| d.state)
    }

    async fn smart_counters(&self, device: &DeviceId) -> Result<SmartCounters, TelemetryError> {
        self.read(Query::SmartCounters, device, |d| d.smart)
    }

    async fn log_positions(&self, device: &DeviceId) -> Result<LogPositions, TelemetryError> {
        self.read(Query::LogPositions, device, |d| d.log)
    }

    async fn prepare_latency(&self, device: &DeviceId) -> Result<PrepareLatency, TelemetryError> {
        self.read(Query::PrepareLatency, device, |d| d.prepare)
    }

    async fn dedup_stats(&self, device: &DeviceId) -> Result<DedupStats, TelemetryError> {
        self.read(Query::DedupStats, device, |d| d.dedup)
    }

    async fn reclaim_complete(&self, device: &DeviceId) -> Result<bool, TelemetryError> {
        self.read(Query::ReclaimComplete, device, |d| d.reclaim_complete)
    }

    async fn host_is_virtual_machine(&self) -> Result<bool, TelemetryError> {
        Ok(self.state.lock().virtual_machine)
    }

    async fn config(&self) -> Result<MonitorConfig, TelemetryError> {
        let state = self.state.lock();
        if state.config_unavailable {
            return Err(TelemetryError::unavailable(Query::Config.as_str(), None));
        }
        Ok(state.config.clone())
    }
}
