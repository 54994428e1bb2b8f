//! The monitor's periodic main loop.
//!
//! One cycle reads the monitor policy, advances dedup space reclaim,
//! refreshes the device inventory, scans every device, then runs the remount
//! and evacuation passes. Cycles never overlap: each is awaited to completion
//! before the next sleep starts.

use crate::congestion::{CongestionConfig, CongestionMonitor};
use crate::evacuation::{EvacuationController, EvacuationRecord, latency_evacuation_allowed};
use crate::events::{EventBus, MonitorEvent};
use crate::host::HostCommandInterface;
use crate::latency::{
    HealthSignal, IoDirection, LatencyHealthSampler, SamplerConfig, ThresholdBand,
    threshold_band,
};
use crate::log_health::LogHealthDiagnostics;
use crate::reclaim::DedupSpaceReclaimScheduler;
use crate::registry::{DeviceRegistry, EvacuationReason};
use crate::remount::{RemountController, RemountOutcome};
use crate::smart::SmartAdvisor;
use anyhow::{Context, Result};
use ddh_common::types::DEFAULT_POLL_INTERVAL_SECS;
use ddh_common::{DeviceHealth, DeviceId, IoLatencyStats, LatencyStats, MonitorConfig, Tier};
use ddh_telemetry::TelemetrySource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sleep applied while monitoring is disabled.
pub const DISABLED_SLEEP: Duration = Duration::from_secs(600);

/// Sleep applied after a failed cycle.
pub const ERROR_SLEEP: Duration = Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS);

/// Scheduler construction options.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    pub congestion: CongestionConfig,
    /// Seed for interval sampling; random when unset.
    pub seed: Option<u64>,
}

/// Devices enumerated this cycle with their health.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub caching: Vec<DeviceId>,
    pub capacity: Vec<DeviceId>,
    health: HashMap<DeviceId, DeviceHealth>,
}

impl Inventory {
    pub fn is_incomplete(&self) -> bool {
        self.caching.is_empty() || self.capacity.is_empty()
    }

    /// Health read this cycle. `None` when it could not be read.
    pub fn health(&self, device: &DeviceId) -> Option<DeviceHealth> {
        self.health.get(device).copied()
    }

    fn devices(&self) -> impl Iterator<Item = (&DeviceId, Tier)> {
        self.caching
            .iter()
            .map(|id| (id, Tier::Caching))
            .chain(self.capacity.iter().map(|id| (id, Tier::Capacity)))
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Monitoring disabled by policy or on a virtual machine host.
    Disabled,
    /// A tier has no devices; only remounts ran.
    WaitingForDevices,
    Scanned,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub kind: CycleKind,
    /// Sleep before the next cycle.
    pub sleep: Duration,
    pub remounts: Vec<(DeviceId, RemountOutcome)>,
    pub evacuations: Vec<EvacuationRecord>,
}

impl CycleReport {
    fn new(kind: CycleKind, sleep: Duration) -> Self {
        Self {
            kind,
            sleep,
            remounts: Vec::new(),
            evacuations: Vec::new(),
        }
    }
}

pub struct MonitorScheduler {
    telemetry: Arc<dyn TelemetrySource>,
    host: Arc<dyn HostCommandInterface>,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    sampler: Mutex<LatencyHealthSampler>,
    congestion: CongestionMonitor,
    log_health: LogHealthDiagnostics,
    smart: Arc<SmartAdvisor>,
    remount: RemountController,
    evacuation: EvacuationController,
    reclaim: DedupSpaceReclaimScheduler,
    shutdown: CancellationToken,
}

impl MonitorScheduler {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        host: Arc<dyn HostCommandInterface>,
        events: EventBus,
        options: SchedulerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let sampler = match options.seed {
            Some(seed) => LatencyHealthSampler::with_seed(seed),
            None => LatencyHealthSampler::new(),
        };
        let smart = Arc::new(SmartAdvisor::new(
            telemetry.clone(),
            registry.clone(),
            events.clone(),
        ));
        Self {
            congestion: CongestionMonitor::new(
                telemetry.clone(),
                registry.clone(),
                events.clone(),
                options.congestion,
                shutdown.child_token(),
            ),
            log_health: LogHealthDiagnostics::new(
                telemetry.clone(),
                registry.clone(),
                events.clone(),
            ),
            remount: RemountController::new(
                telemetry.clone(),
                host.clone(),
                registry.clone(),
                events.clone(),
            ),
            evacuation: EvacuationController::new(
                host.clone(),
                registry.clone(),
                smart.clone(),
                events.clone(),
            ),
            reclaim: DedupSpaceReclaimScheduler::new(telemetry.clone(), host.clone(), events.clone()),
            sampler: Mutex::new(sampler),
            smart,
            telemetry,
            host,
            registry,
            events,
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run cycles until shutdown, then stop congestion watches.
    pub async fn run(self: Arc<Self>) {
        info!("Device monitor started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            // A panicking cycle surfaces as a join error instead of killing the loop.
            let this = self.clone();
            let sleep = match tokio::spawn(async move { this.run_cycle().await }).await {
                Ok(Ok(report)) => {
                    debug!(
                        kind = ?report.kind,
                        sleep = ?report.sleep,
                        evacuations = report.evacuations.len(),
                        "Monitor cycle complete"
                    );
                    report.sleep
                }
                Ok(Err(e)) => {
                    warn!("Monitor cycle failed: {e:#}");
                    ERROR_SLEEP
                }
                Err(e) => {
                    error!("Monitor cycle aborted: {e}");
                    ERROR_SLEEP
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        self.shutdown().await;
    }

    /// Cancel congestion watches and wait for them.
    pub async fn shutdown(&self) {
        info!(in_flight = self.congestion.in_flight(), "Stopping device monitor");
        self.congestion.shutdown().await;
        info!("Device monitor stopped");
    }

    /// Run one monitor cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let config = self
            .telemetry
            .config()
            .await
            .context("reading monitor config")?;

        match self.reclaim.run_once(config.dedup_space_reclaim).await {
            Ok(decision) => debug!(?decision, "Dedup space reclaim step"),
            Err(e) => warn!("Dedup space reclaim skipped: {e:#}"),
        }

        if !config.device_monitoring_enabled {
            info!("Device monitoring is disabled");
            return Ok(CycleReport::new(CycleKind::Disabled, DISABLED_SLEEP));
        }
        if !config.monitor_in_vm_enabled && self.host_is_virtual_machine().await {
            info!("Host is a virtual machine; device monitoring is disabled");
            return Ok(CycleReport::new(CycleKind::Disabled, DISABLED_SLEEP));
        }

        let poll = config.poll_interval();
        let inventory = self.refresh_devices(&config).await?;

        if inventory.is_incomplete() {
            debug!(
                caching = inventory.caching.len(),
                capacity = inventory.capacity.len(),
                "Waiting for devices in both tiers"
            );
            let mut report = CycleReport::new(CycleKind::WaitingForDevices, poll * 2);
            report.remounts = self.remount.remount_all(&config).await;
            return Ok(report);
        }

        let sampler_config = SamplerConfig::from_monitor(&config);
        for (device, tier) in inventory.devices() {
            match inventory.health(device) {
                Some(health) if health.is_monitorable() => {
                    self.scan_device(device, tier, &config, sampler_config).await;
                }
                Some(health) => debug!(device = %device, %health, "Not monitoring device"),
                None => {}
            }
        }
        for device in &inventory.caching {
            self.log_health.diagnose(device, &config).await;
        }
        let started = self.congestion.scan(&inventory.caching);
        if started > 0 {
            debug!(started, "Congestion watches started");
        }

        let mut report = CycleReport::new(CycleKind::Scanned, poll);
        report.remounts = self.remount.remount_all(&config).await;
        report.evacuations = self.evacuation.evacuate_all(&config).await;
        Ok(report)
    }

    async fn host_is_virtual_machine(&self) -> bool {
        match self.telemetry.host_is_virtual_machine().await {
            Ok(virtual_machine) => virtual_machine,
            Err(e) => {
                warn!("Cannot tell whether the host is a virtual machine: {e}");
                false
            }
        }
    }

    /// Enumerate devices, refresh the dedup index and record failures.
    pub async fn refresh_devices(&self, config: &MonitorConfig) -> Result<Inventory> {
        let mut inventory = Inventory {
            caching: self
                .telemetry
                .list_devices(Tier::Caching)
                .await
                .context("listing caching devices")?,
            capacity: self
                .telemetry
                .list_devices(Tier::Capacity)
                .await
                .context("listing capacity devices")?,
            health: HashMap::new(),
        };

        for (device, tier) in inventory.devices() {
            self.registry.observe(device, tier);
            match self.telemetry.dedup_stats(device).await {
                Ok(stats) => self.registry.set_dedup_scope(device, stats.scope),
                Err(e) => debug!(device = %device, "Dedup scope unavailable: {e}"),
            }
        }
        match self.telemetry.dedup_mappings().await {
            Ok(mappings) => self.registry.rebuild_dedup_index(&mappings),
            Err(e) => warn!("Dedup mappings unavailable; keeping previous index: {e}"),
        }

        let now = Instant::now();
        let mut health = HashMap::new();
        for (device, _) in inventory.devices() {
            let reading = match self.telemetry.health(device).await {
                Ok(reading) => reading,
                Err(e) => {
                    debug!(device = %device, "Health unavailable: {e}");
                    continue;
                }
            };
            if reading.is_failed() && config.remount_after_failed {
                if let Err(e) = self.remount.mark_failed(device, now) {
                    warn!(device = %device, "Cannot track failed device: {e}");
                }
            }
            health.insert(device.clone(), reading);
        }
        inventory.health = health;
        Ok(inventory)
    }

    async fn scan_device(
        &self,
        device: &DeviceId,
        tier: Tier,
        config: &MonitorConfig,
        sampler_config: SamplerConfig,
    ) {
        let stats = match self.telemetry.latency_stats(device).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(device = %device, "Latency stats unavailable: {e}");
                return;
            }
        };

        self.check_attributes(device, &stats, config);
        self.track_degrading(device, &stats);

        let mut exceeded = false;
        if let HealthSignal::Exceeded { .. } = LatencyHealthSampler::observe_read(&stats.read) {
            exceeded = true;
            self.report_exceeded(device, IoDirection::Read, &stats.read, false, 0, 0);
        }

        let signal = {
            let mut sampler = self.sampler.lock();
            self.registry.with_device(device, |d| {
                sampler.observe_write(&mut d.latency, &stats.write, sampler_config)
            })
        };
        match signal {
            Some(HealthSignal::Exceeded {
                counted,
                exceeded: count,
                required,
            }) => {
                exceeded = true;
                self.report_exceeded(device, IoDirection::Write, &stats.write, counted, count, required);
            }
            Some(HealthSignal::MustEvacuate {
                exceeded: count,
                required,
            }) => {
                exceeded = true;
                self.report_exceeded(device, IoDirection::Write, &stats.write, true, count, required);
                self.registry.clear_degrading(device);
                if latency_evacuation_allowed(config, tier, self.registry.is_mapped(device)) {
                    if self
                        .registry
                        .flag_evacuation(device, EvacuationReason::Latency)
                    {
                        warn!(
                            device = %device,
                            exceeded = count,
                            required,
                            "Write latency persisted; device must be evacuated"
                        );
                    }
                } else {
                    info!(
                        device = %device,
                        %tier,
                        "Write latency persisted; evacuation not permitted by policy"
                    );
                }
            }
            _ => {}
        }

        if exceeded {
            if let Err(e) = self.host.reset_latency_stats(device).await {
                warn!(device = %device, "Failed to reset latency stats: {e}");
            }
        }

        self.smart.check(device).await;
    }

    fn report_exceeded(
        &self,
        device: &DeviceId,
        direction: IoDirection,
        stats: &IoLatencyStats,
        counted: bool,
        exceeded: u32,
        required: u32,
    ) {
        warn!(
            device = %device,
            %direction,
            latency_us = stats.max_average_latency_us,
            threshold_us = stats.threshold_us,
            times = stats.threshold_exceeded_count,
            counted,
            "Average latency exceeded threshold"
        );
        self.events.publish(&MonitorEvent::LatencyExceeded {
            device: device.clone(),
            direction,
            latency_us: stats.max_average_latency_us,
            threshold_us: stats.threshold_us,
            counted,
            exceeded,
            required,
        });
    }

    /// Maintain the half-threshold warning set.
    fn track_degrading(&self, device: &DeviceId, stats: &LatencyStats) {
        let directions = [
            (IoDirection::Read, &stats.read),
            (IoDirection::Write, &stats.write),
        ];
        let mut all_low = true;
        for (direction, io) in directions {
            match threshold_band(io) {
                ThresholdBand::Degrading => {
                    all_low = false;
                    if self.registry.mark_degrading(device) {
                        warn!(
                            device = %device,
                            %direction,
                            latency_us = io.max_average_latency_us,
                            half_threshold_us = io.half_threshold_us(),
                            "Average latency above half of the threshold"
                        );
                        self.events.publish(&MonitorEvent::Degrading {
                            device: device.clone(),
                            direction,
                            latency_us: io.max_average_latency_us,
                            threshold_us: io.threshold_us,
                        });
                    }
                }
                ThresholdBand::High => all_low = false,
                ThresholdBand::Low => {}
            }
        }
        if all_low && self.registry.clear_degrading(device) {
            info!(device = %device, "Average latency back under half of the threshold");
        }
    }

    fn check_attributes(&self, device: &DeviceId, stats: &LatencyStats, config: &MonitorConfig) {
        let interval_secs = stats.moving_average_interval_secs;
        let poll_secs = config.poll_interval_secs;
        if interval_secs > poll_secs {
            if self.registry.warn_attribute_once(device) {
                warn!(
                    device = %device,
                    interval_secs,
                    poll_secs,
                    "Moving average latency interval is longer than the poll interval; please correct"
                );
                self.events.publish(&MonitorEvent::MisconfiguredLatencyInterval {
                    device: device.clone(),
                    interval_secs,
                    poll_secs,
                });
            }
        } else if self.registry.clear_attribute_warning(device) {
            info!(device = %device, interval_secs, "Moving average latency interval corrected");
        }
    }
}
