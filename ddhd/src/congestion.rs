//! Sustained congestion detection on caching devices.
//!
//! Each watch is a short-lived task that samples the congestion score for a
//! fixed window and queues the device for evacuation when the average stays
//! above the threshold. Watches are tracked so shutdown can cancel and await
//! them.

use crate::events::{EventBus, MonitorEvent};
use crate::registry::{DeviceRegistry, EvacuationReason};
use ddh_common::DeviceId;
use ddh_telemetry::TelemetrySource;
use ddh_telemetry::schema::MAX_CONGESTION_SCORE;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default sampling window of one watch.
pub const DEFAULT_CONGESTION_WINDOW: Duration = Duration::from_secs(300);

/// Default time between two congestion samples.
pub const DEFAULT_CONGESTION_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Congestion watch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CongestionConfig {
    /// How long one watch samples.
    pub window: Duration,
    /// Pause between samples.
    pub sample_interval: Duration,
    /// Averages strictly above this convict the device.
    pub threshold: u32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_CONGESTION_WINDOW,
            sample_interval: DEFAULT_CONGESTION_SAMPLE_INTERVAL,
            threshold: MAX_CONGESTION_SCORE,
        }
    }
}

/// Result of one completed watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CongestionVerdict {
    NoSamples,
    Acceptable { average: f64 },
    Congested { average: f64 },
}

pub fn judge(samples: &[u32], threshold: u32) -> CongestionVerdict {
    if samples.is_empty() {
        return CongestionVerdict::NoSamples;
    }
    let total: u64 = samples.iter().map(|s| u64::from(*s)).sum();
    let average = total as f64 / samples.len() as f64;
    if average > f64::from(threshold) {
        CongestionVerdict::Congested { average }
    } else {
        CongestionVerdict::Acceptable { average }
    }
}

/// Spawns and supervises congestion watches.
pub struct CongestionMonitor {
    telemetry: Arc<dyn TelemetrySource>,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
    config: CongestionConfig,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl CongestionMonitor {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        registry: Arc<DeviceRegistry>,
        events: EventBus,
        config: CongestionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            telemetry,
            registry,
            events,
            config,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Start watching `device`. Returns `false` when a watch is already
    /// running for it or the monitor is shutting down.
    pub fn start_watch(&self, device: &DeviceId) -> bool {
        if self.shutdown.is_cancelled() || !self.registry.begin_congestion_watch(device) {
            return false;
        }

        let telemetry = self.telemetry.clone();
        let registry = self.registry.clone();
        let events = self.events.clone();
        let config = self.config;
        let shutdown = self.shutdown.clone();
        let device = device.clone();

        debug!(device = %device, window = ?config.window, "Congestion watch started");
        self.tracker.spawn(async move {
            let Some(samples) = sample_window(telemetry.as_ref(), &device, config, &shutdown).await
            else {
                registry.end_congestion_watch(&device);
                debug!(device = %device, "Congestion watch cancelled");
                return;
            };
            registry.end_congestion_watch(&device);

            match judge(&samples, config.threshold) {
                CongestionVerdict::NoSamples => {
                    debug!(device = %device, "Congestion watch collected no samples");
                }
                CongestionVerdict::Acceptable { average } => {
                    debug!(device = %device, average, "Congestion within limits");
                }
                CongestionVerdict::Congested { average } => {
                    if registry.has_high_latency(&device) {
                        info!(
                            device = %device,
                            average,
                            "Congested device already flagged for latency; not evacuating"
                        );
                        return;
                    }
                    warn!(
                        device = %device,
                        average,
                        threshold = config.threshold,
                        "Sustained congestion; device must be evacuated"
                    );
                    events.publish(&MonitorEvent::CongestionHigh {
                        device: device.clone(),
                        average,
                        threshold: config.threshold,
                    });
                    registry.flag_evacuation(&device, EvacuationReason::Congestion);
                }
            }
        });
        true
    }

    /// Start a watch for every device not already watched.
    pub fn scan(&self, devices: &[DeviceId]) -> usize {
        devices
            .iter()
            .filter(|device| self.start_watch(device))
            .count()
    }

    /// Watches still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel all watches and wait for them to unregister.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Sample until the window has elapsed. `None` when cancelled.
async fn sample_window(
    telemetry: &dyn TelemetrySource,
    device: &DeviceId,
    config: CongestionConfig,
    shutdown: &CancellationToken,
) -> Option<Vec<u32>> {
    let start = Instant::now();
    let mut samples = Vec::new();
    loop {
        match telemetry.congestion_score(device).await {
            Ok(score) => samples.push(score),
            Err(e) => debug!(device = %device, "Congestion sample failed: {e}"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(config.sample_interval) => {}
        }
        if start.elapsed() >= config.window {
            return Some(samples);
        }
    }
}
