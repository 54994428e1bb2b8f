//! Operator events broadcast by the monitor.
//!
//! Events are JSON lines `{event, data, timestamp}` on a broadcast channel.
//! Emission never blocks and never fails the caller; the daemon subscribes a
//! forwarder that writes every event to the log.

use crate::device::ThrottleReason;
use crate::latency::IoDirection;
use crate::registry::EvacuationReason;
use chrono::Utc;
use ddh_common::{DeviceId, EvacuationEvent, ReclaimState};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BUFFER: usize = 256;

/// Something an operator should know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    LatencyExceeded {
        device: DeviceId,
        direction: IoDirection,
        latency_us: u64,
        threshold_us: u64,
        counted: bool,
        exceeded: u32,
        required: u32,
    },
    /// Average latency crossed half the threshold.
    Degrading {
        device: DeviceId,
        direction: IoDirection,
        latency_us: u64,
        threshold_us: u64,
    },
    /// Non-zero SMART error counters; consider replacing the device.
    SmartDegrading { device: DeviceId },
    LogCongested {
        device: DeviceId,
        congestion: u32,
        streak: u32,
        required: u32,
    },
    PrepareLatencyHigh {
        device: DeviceId,
        op: String,
        latency_us: u64,
        threshold_us: u64,
        streak: u32,
        required: u32,
    },
    CongestionHigh {
        device: DeviceId,
        average: f64,
        threshold: u32,
    },
    EvacuationRequested {
        device: DeviceId,
        owner: DeviceId,
        reason: EvacuationReason,
        event: EvacuationEvent,
        success: bool,
    },
    Unmounted { device: DeviceId, success: bool },
    Remounted {
        device: DeviceId,
        success: bool,
        last_attempt: bool,
    },
    RemountThrottled {
        device: DeviceId,
        reason: ThrottleReason,
    },
    RemountRecovered { device: DeviceId },
    ReclaimStateChanged {
        from: ReclaimState,
        to: ReclaimState,
    },
    MisconfiguredLatencyInterval {
        device: DeviceId,
        interval_secs: u64,
        poll_secs: u64,
    },
}

impl MonitorEvent {
    /// Event name on the bus.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LatencyExceeded { .. } => "latency_exceeded",
            Self::Degrading { .. } => "degrading",
            Self::SmartDegrading { .. } => "smart_degrading",
            Self::LogCongested { .. } => "log_congested",
            Self::PrepareLatencyHigh { .. } => "prepare_latency_high",
            Self::CongestionHigh { .. } => "congestion_high",
            Self::EvacuationRequested { .. } => "evacuation_requested",
            Self::Unmounted { .. } => "unmounted",
            Self::Remounted { .. } => "remounted",
            Self::RemountThrottled { .. } => "remount_throttled",
            Self::RemountRecovered { .. } => "remount_recovered",
            Self::ReclaimStateChanged { .. } => "reclaim_state_changed",
            Self::MisconfiguredLatencyInterval { .. } => "misconfigured_latency_interval",
        }
    }
}

/// Broadcast channel for monitor events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                // No subscribers is not an error.
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }

    pub fn publish(&self, event: &MonitorEvent) {
        self.emit(event.name(), event);
    }
}

/// Forward every event on the bus to the log until `shutdown` fires.
pub fn spawn_log_forwarder(bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(line) => info!(target: "ddhd::events", event = %line, "Monitor event"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event forwarder lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Event forwarder stopped");
    })
}
