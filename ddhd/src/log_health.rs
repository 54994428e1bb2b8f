//! Log congestion and log prepare-latency diagnostics for caching devices.

use crate::events::{EventBus, MonitorEvent};
use crate::registry::{DeviceRegistry, EvacuationReason};
use ddh_common::{DeviceId, LogPositions, MonitorConfig, PrepareLatency};
use ddh_telemetry::TelemetrySource;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Log congestion at or above this value counts as maxed out.
pub const LOG_CONGESTION_THRESHOLD: u32 = 251;

/// Prepare latency is only judged above this IOPS floor.
pub const MIN_PREPARE_IOPS: u64 = 1;

/// Per-device log streaks and baselines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogWindow {
    /// Consecutive cycles at maximum congestion without log progress.
    pub congestion_intervals: u32,
    pub plog_baseline: Option<u64>,
    pub llog_baseline: Option<u64>,
    /// Consecutive cycles with slow prepares.
    pub prepare_intervals: u32,
}

impl LogWindow {
    /// Drop baselines and the prepare streak. The congestion streak survives
    /// so evacuation can still pick the log-congestion event.
    pub fn reset_baselines(&mut self) {
        self.plog_baseline = None;
        self.llog_baseline = None;
        self.prepare_intervals = 0;
    }

    fn accept(&mut self, positions: &LogPositions) {
        self.congestion_intervals = 0;
        self.plog_baseline = Some(positions.plog_start);
        self.llog_baseline = Some(positions.llog_start);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVerdict {
    Acceptable,
    Congested { streak: u32, required: u32 },
    MustEvacuate { streak: u32, required: u32 },
}

/// Track one log-congestion observation. A `required` of zero never convicts.
pub fn observe_log_congestion(
    window: &mut LogWindow,
    positions: &LogPositions,
    required: u32,
) -> LogVerdict {
    if positions.congestion >= LOG_CONGESTION_THRESHOLD {
        let plog_stuck = window.plog_baseline == Some(positions.plog_start);
        let llog_stuck = window.llog_baseline == Some(positions.llog_start);
        if plog_stuck || llog_stuck {
            window.congestion_intervals += 1;
            let streak = window.congestion_intervals;
            return if required > 0 && streak >= required {
                LogVerdict::MustEvacuate { streak, required }
            } else {
                LogVerdict::Congested { streak, required }
            };
        }
    }
    window.accept(positions);
    LogVerdict::Acceptable
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVerdict {
    /// Neither clearly slow nor clearly healthy; streak unchanged.
    Inconclusive,
    Healthy,
    Slow {
        op: &'static str,
        latency_us: u64,
        threshold_us: u64,
        streak: u32,
        required: u32,
    },
    MustEvacuate {
        op: &'static str,
        latency_us: u64,
        threshold_us: u64,
        streak: u32,
        required: u32,
    },
}

pub fn observe_prepare_latency(
    window: &mut LogWindow,
    prepare: &PrepareLatency,
    required: u32,
) -> PrepareVerdict {
    let ops = prepare.ops();
    let slow = ops
        .iter()
        .find(|(_, op)| op.average_latency_us > op.threshold_us && op.iops > MIN_PREPARE_IOPS);

    if let Some(&(name, op)) = slow {
        window.prepare_intervals += 1;
        let streak = window.prepare_intervals;
        return if required > 0 && streak >= required {
            PrepareVerdict::MustEvacuate {
                op: name,
                latency_us: op.average_latency_us,
                threshold_us: op.threshold_us,
                streak,
                required,
            }
        } else {
            PrepareVerdict::Slow {
                op: name,
                latency_us: op.average_latency_us,
                threshold_us: op.threshold_us,
                streak,
                required,
            }
        };
    }

    if ops
        .iter()
        .all(|(_, op)| op.average_latency_us < op.threshold_us && op.iops > MIN_PREPARE_IOPS)
    {
        window.prepare_intervals = 0;
        return PrepareVerdict::Healthy;
    }
    PrepareVerdict::Inconclusive
}

/// Runs the log diagnostics of caching devices against live telemetry.
pub struct LogHealthDiagnostics {
    telemetry: Arc<dyn TelemetrySource>,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
}

impl LogHealthDiagnostics {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        registry: Arc<DeviceRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            telemetry,
            registry,
            events,
        }
    }

    /// Diagnose one caching device. Skipped when its caching state is not OK.
    pub async fn diagnose(&self, device: &DeviceId, config: &MonitorConfig) {
        match self.telemetry.device_state(device).await {
            Ok(state) if !state.state_ok => {
                debug!(device = %device, "Skipping log diagnostics: caching state not OK");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(device = %device, "Skipping log diagnostics: {e}");
                return;
            }
        }

        if config.log_congestion_diagnosis {
            self.diagnose_congestion(device, config).await;
        }
        if config.prepare_latency_diagnosis {
            self.diagnose_prepare(device, config).await;
        }
    }

    async fn diagnose_congestion(&self, device: &DeviceId, config: &MonitorConfig) {
        let positions = match self.telemetry.log_positions(device).await {
            Ok(positions) => positions,
            Err(e) => {
                debug!(device = %device, "Log positions unavailable: {e}");
                return;
            }
        };
        let Some(verdict) = self.registry.with_device(device, |d| {
            observe_log_congestion(&mut d.log, &positions, config.log_congestion_interval_count)
        }) else {
            return;
        };

        match verdict {
            LogVerdict::Acceptable => {}
            LogVerdict::Congested { streak, required } => {
                warn!(
                    device = %device,
                    congestion = positions.congestion,
                    streak,
                    required,
                    "Log congestion at maximum without log progress"
                );
                self.events.publish(&MonitorEvent::LogCongested {
                    device: device.clone(),
                    congestion: positions.congestion,
                    streak,
                    required,
                });
            }
            LogVerdict::MustEvacuate { streak, required } => {
                warn!(
                    device = %device,
                    congestion = positions.congestion,
                    streak,
                    required,
                    "Log congestion persisted; disk group must be evacuated"
                );
                self.events.publish(&MonitorEvent::LogCongested {
                    device: device.clone(),
                    congestion: positions.congestion,
                    streak,
                    required,
                });
                if self
                    .registry
                    .flag_evacuation(device, EvacuationReason::LogCongestion)
                {
                    info!(device = %device, "Queued for evacuation (log congestion)");
                }
            }
        }
    }

    async fn diagnose_prepare(&self, device: &DeviceId, config: &MonitorConfig) {
        let prepare = match self.telemetry.prepare_latency(device).await {
            Ok(prepare) => prepare,
            Err(e) => {
                debug!(device = %device, "Prepare latency unavailable: {e}");
                return;
            }
        };
        let Some(verdict) = self.registry.with_device(device, |d| {
            observe_prepare_latency(&mut d.log, &prepare, config.prepare_latency_interval_count)
        }) else {
            return;
        };

        match verdict {
            PrepareVerdict::Inconclusive | PrepareVerdict::Healthy => {}
            PrepareVerdict::Slow {
                op,
                latency_us,
                threshold_us,
                streak,
                required,
            } => {
                warn!(
                    device = %device,
                    op,
                    latency_us,
                    threshold_us,
                    streak,
                    required,
                    "Log prepare latency above threshold"
                );
                self.events.publish(&MonitorEvent::PrepareLatencyHigh {
                    device: device.clone(),
                    op: op.to_string(),
                    latency_us,
                    threshold_us,
                    streak,
                    required,
                });
            }
            PrepareVerdict::MustEvacuate {
                op,
                latency_us,
                threshold_us,
                streak,
                required,
            } => {
                warn!(
                    device = %device,
                    op,
                    latency_us,
                    threshold_us,
                    streak,
                    required,
                    "Log prepare latency persisted; disk group must be evacuated"
                );
                self.events.publish(&MonitorEvent::PrepareLatencyHigh {
                    device: device.clone(),
                    op: op.to_string(),
                    latency_us,
                    threshold_us,
                    streak,
                    required,
                });
                if self
                    .registry
                    .flag_evacuation(device, EvacuationReason::PrepareLatency)
                {
                    info!(device = %device, "Queued for evacuation (prepare latency)");
                }
            }
        }
    }
}
