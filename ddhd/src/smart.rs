//! Advisory SMART checks. Never triggers evacuation on its own.

use crate::events::{EventBus, MonitorEvent};
use crate::registry::DeviceRegistry;
use ddh_common::DeviceId;
use ddh_telemetry::TelemetrySource;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SmartAdvisor {
    telemetry: Arc<dyn TelemetrySource>,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
}

impl SmartAdvisor {
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

    /// Warn once when any error counter is non-zero. Returns `true` when the
    /// device was newly marked SMART-degraded.
    pub async fn check(&self, device: &DeviceId) -> bool {
        let counters = match self.telemetry.smart_counters(device).await {
            Ok(counters) => counters,
            Err(e) => {
                debug!(device = %device, "SMART counters unavailable: {e}");
                return false;
            }
        };
        if !counters.any_nonzero() || !self.registry.mark_smart_degraded(device) {
            return false;
        }

        warn!(
            device = %device,
            uncorrectable_sectors = counters.uncorrectable_sectors,
            reported_uncorrectable_errors = counters.reported_uncorrectable_errors,
            reallocated_sectors = counters.reallocated_sectors,
            reallocation_events = counters.reallocation_events,
            pending_reallocations = counters.pending_reallocations,
            command_timeouts = counters.command_timeouts,
            "Device is degrading; consider replacing it"
        );
        self.events.publish(&MonitorEvent::SmartDegrading {
            device: device.clone(),
        });
        true
    }

    /// Log all counters of a device, healthy or not.
    pub async fn dump(&self, device: &DeviceId) {
        match self.telemetry.smart_counters(device).await {
            Ok(counters) => info!(
                device = %device,
                uncorrectable_sectors = counters.uncorrectable_sectors,
                reported_uncorrectable_errors = counters.reported_uncorrectable_errors,
                reallocated_sectors = counters.reallocated_sectors,
                reallocation_events = counters.reallocation_events,
                pending_reallocations = counters.pending_reallocations,
                command_timeouts = counters.command_timeouts,
                "SMART counters"
            ),
            Err(e) => warn!(device = %device, "Failed to read SMART counters: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddh_common::{SmartCounters, Tier};
    use ddh_telemetry::mock::MockTelemetry;

    fn advisor(mock: &Arc<MockTelemetry>) -> (SmartAdvisor, Arc<DeviceRegistry>, EventBus) {
        let registry = Arc::new(DeviceRegistry::new());
        let events = EventBus::default();
        let advisor = SmartAdvisor::new(mock.clone(), registry.clone(), events.clone());
        (advisor, registry, events)
    }

    #[tokio::test]
    async fn clean_counters_are_not_reported() {
        let mock = Arc::new(MockTelemetry::new());
        let id = DeviceId::new("naa.01");
        mock.add_device(id.clone(), Tier::Capacity);
        let (advisor, registry, _) = advisor(&mock);

        assert!(!advisor.check(&id).await);
        assert!(!registry.is_smart_degraded(&id));
    }

    #[tokio::test]
    async fn non_zero_counters_warn_once() {
        let mock = Arc::new(MockTelemetry::new());
        let id = DeviceId::new("naa.01");
        mock.add_device(id.clone(), Tier::Capacity);
        mock.set_smart(
            &id,
            SmartCounters {
                pending_reallocations: 4,
                ..Default::default()
            },
        );
        let (advisor, registry, events) = advisor(&mock);
        let mut rx = events.subscribe();

        assert!(advisor.check(&id).await);
        assert!(!advisor.check(&id).await);
        assert!(registry.is_smart_degraded(&id));
        assert!(registry.has_high_latency(&id));

        let first = rx.try_recv().expect("one event");
        assert!(first.contains("smart_degrading"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unavailable_counters_are_skipped() {
        let mock = Arc::new(MockTelemetry::new());
        let id = DeviceId::new("naa.01");
        mock.add_device(id.clone(), Tier::Capacity);
        mock.fail_device(&id);
        let (advisor, _, _) = advisor(&mock);

        assert!(!advisor.check(&id).await);
        advisor.dump(&id).await;
    }
}
