//! Evacuation of devices queued by the diagnostics.

use crate::events::{EventBus, MonitorEvent};
use crate::host::HostCommandInterface;
use crate::registry::{DeviceRegistry, EvacuationReason};
use crate::smart::SmartAdvisor;
use ddh_common::{DeviceId, EvacuationEvent, MonitorConfig, Tier};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Whether a latency verdict may evacuate a device.
///
/// Capacity devices (mapped or not) always may; caching devices only when
/// tier-one evacuation is enabled.
pub fn latency_evacuation_allowed(config: &MonitorConfig, tier: Tier, mapped: bool) -> bool {
    config.pull_the_plug && (tier == Tier::Capacity || mapped || config.pull_the_plug_on_tier1)
}

/// Pick the event code for an evacuation of `owner`.
pub fn select_event(
    reason: EvacuationReason,
    owner_tier: Tier,
    owner_log_streak: u32,
    log_streak_limit: u32,
) -> EvacuationEvent {
    match owner_tier {
        Tier::Caching
            if reason == EvacuationReason::LogCongestion
                || (log_streak_limit > 0 && owner_log_streak >= log_streak_limit) =>
        {
            EvacuationEvent::DiskGroupLogCongested
        }
        Tier::Caching => EvacuationEvent::CachingUnhealthy,
        Tier::Capacity => EvacuationEvent::CapacityUnhealthy,
    }
}

/// One evacuation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvacuationRecord {
    pub device: DeviceId,
    pub owner: DeviceId,
    pub reason: EvacuationReason,
    pub event: EvacuationEvent,
    pub success: bool,
}

pub struct EvacuationController {
    host: Arc<dyn HostCommandInterface>,
    registry: Arc<DeviceRegistry>,
    smart: Arc<SmartAdvisor>,
    events: EventBus,
}

impl EvacuationController {
    pub fn new(
        host: Arc<dyn HostCommandInterface>,
        registry: Arc<DeviceRegistry>,
        smart: Arc<SmartAdvisor>,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            registry,
            smart,
            events,
        }
    }

    /// Drain the evacuation queue, attempting each entry once.
    pub async fn evacuate_all(&self, config: &MonitorConfig) -> Vec<EvacuationRecord> {
        let mut records = Vec::new();
        for (device, reason) in self.registry.take_evacuations() {
            if let Some(record) = self.evacuate(&device, reason, config).await {
                records.push(record);
            }
        }
        records
    }

    async fn evacuate(
        &self,
        device: &DeviceId,
        reason: EvacuationReason,
        config: &MonitorConfig,
    ) -> Option<EvacuationRecord> {
        let owner = match self.registry.owner_of(device) {
            Ok(owner) => owner,
            Err(e) => {
                error!(device = %device, %reason, "Cannot evacuate: {e}");
                return None;
            }
        };

        self.registry.with_device(device, |d| d.reset_diagnostics());
        let (owner_tier, owner_streak) = self
            .registry
            .with_device(&owner, |d| {
                d.reset_diagnostics();
                (d.tier, d.log.congestion_intervals)
            })
            .unwrap_or((Tier::Capacity, 0));

        self.smart.dump(device).await;

        let event = select_event(
            reason,
            owner_tier,
            owner_streak,
            config.log_congestion_interval_count,
        );
        let success = match self.host.evacuate(&owner, event).await {
            Ok(()) => {
                info!(device = %device, owner = %owner, %reason, %event, "Evacuation requested");
                true
            }
            Err(e) => {
                warn!(device = %device, owner = %owner, %reason, %event, "Evacuation request failed: {e}");
                false
            }
        };

        // The streak only selects the event; a new diagnosis starts from zero.
        for id in [device, &owner] {
            self.registry
                .with_device(id, |d| d.log.congestion_intervals = 0);
        }

        self.events.publish(&MonitorEvent::EvacuationRequested {
            device: device.clone(),
            owner: owner.clone(),
            reason,
            event,
            success,
        });
        Some(EvacuationRecord {
            device: device.clone(),
            owner,
            reason,
            event,
            success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, MockHost};
    use ddh_common::{DedupScope, DiskGroupMapping};
    use ddh_telemetry::mock::MockTelemetry;

    struct Fixture {
        host: Arc<MockHost>,
        registry: Arc<DeviceRegistry>,
        controller: EvacuationController,
    }

    fn fixture() -> Fixture {
        let telemetry = Arc::new(MockTelemetry::new());
        let host = Arc::new(MockHost::new(telemetry.clone()));
        let registry = Arc::new(DeviceRegistry::new());
        let events = EventBus::default();
        let smart = Arc::new(SmartAdvisor::new(
            telemetry.clone(),
            registry.clone(),
            events.clone(),
        ));
        let controller =
            EvacuationController::new(host.clone(), registry.clone(), smart, events);
        Fixture {
            host,
            registry,
            controller,
        }
    }

    fn id(name: &str) -> DeviceId {
        DeviceId::new(name)
    }

    fn dedup_group(f: &Fixture) {
        f.registry.observe(&id("cache-1"), Tier::Caching);
        f.registry.observe(&id("cap-1"), Tier::Capacity);
        f.registry.set_dedup_scope(&id("cache-1"), DedupScope::DiskGroup);
        f.registry.set_dedup_scope(&id("cap-1"), DedupScope::DiskGroup);
        f.registry.rebuild_dedup_index(&[DiskGroupMapping {
            caching: id("cache-1"),
            capacity: vec![id("cap-1")],
        }]);
    }

    #[test]
    fn latency_permission_matrix() {
        let mut config = MonitorConfig::default();
        assert!(latency_evacuation_allowed(&config, Tier::Capacity, false));
        assert!(!latency_evacuation_allowed(&config, Tier::Caching, false));
        assert!(latency_evacuation_allowed(&config, Tier::Caching, true));
        config.pull_the_plug_on_tier1 = true;
        assert!(latency_evacuation_allowed(&config, Tier::Caching, false));
        config.pull_the_plug = false;
        assert!(!latency_evacuation_allowed(&config, Tier::Capacity, false));
    }

    #[test]
    fn event_selection() {
        use EvacuationReason::*;
        assert_eq!(
            select_event(Latency, Tier::Capacity, 9, 3),
            EvacuationEvent::CapacityUnhealthy
        );
        assert_eq!(
            select_event(Latency, Tier::Caching, 0, 3),
            EvacuationEvent::CachingUnhealthy
        );
        assert_eq!(
            select_event(Congestion, Tier::Caching, 3, 3),
            EvacuationEvent::DiskGroupLogCongested
        );
        assert_eq!(
            select_event(LogCongestion, Tier::Caching, 0, 3),
            EvacuationEvent::DiskGroupLogCongested
        );
        assert_eq!(
            select_event(PrepareLatency, Tier::Caching, 0, 0),
            EvacuationEvent::CachingUnhealthy
        );
    }

    #[tokio::test]
    async fn mapped_capacity_device_evacuates_its_disk_group() {
        let f = fixture();
        dedup_group(&f);
        f.registry.with_device(&id("cap-1"), |d| {
            d.latency.exceeded_count = 4;
            d.latency.interval_count = 9;
        });
        f.registry
            .flag_evacuation(&id("cap-1"), EvacuationReason::Latency);

        let records = f.controller.evacuate_all(&MonitorConfig::default()).await;
        assert_eq!(
            records,
            vec![EvacuationRecord {
                device: id("cap-1"),
                owner: id("cache-1"),
                reason: EvacuationReason::Latency,
                event: EvacuationEvent::CachingUnhealthy,
                success: true,
            }]
        );
        assert_eq!(
            f.host.evacuations(),
            vec![(id("cache-1"), EvacuationEvent::CachingUnhealthy)]
        );
        let device = f.registry.snapshot(&id("cap-1")).unwrap();
        assert_eq!(device.latency.exceeded_count, 0);
        assert!(f.registry.pending_evacuations().is_empty());
    }

    #[tokio::test]
    async fn log_streak_on_owner_selects_log_event_then_resets() {
        let f = fixture();
        dedup_group(&f);
        f.registry
            .with_device(&id("cache-1"), |d| d.log.congestion_intervals = 3);
        f.registry
            .flag_evacuation(&id("cache-1"), EvacuationReason::PrepareLatency);

        let records = f.controller.evacuate_all(&MonitorConfig::default()).await;
        assert_eq!(records[0].event, EvacuationEvent::DiskGroupLogCongested);
        let owner = f.registry.snapshot(&id("cache-1")).unwrap();
        assert_eq!(owner.log.congestion_intervals, 0);
    }

    #[tokio::test]
    async fn failed_request_is_not_retried_without_new_diagnosis() {
        let f = fixture();
        f.registry.observe(&id("cap-9"), Tier::Capacity);
        f.host.fail_action("evacuate");
        f.registry
            .flag_evacuation(&id("cap-9"), EvacuationReason::Congestion);

        let records = f.controller.evacuate_all(&MonitorConfig::default()).await;
        assert!(!records[0].success);
        assert!(f.controller.evacuate_all(&MonitorConfig::default()).await.is_empty());
        assert_eq!(
            f.host.calls(),
            vec![HostCall::Evacuate(id("cap-9"), EvacuationEvent::CapacityUnhealthy)]
        );
    }

    #[tokio::test]
    async fn unresolvable_owner_is_skipped() {
        let f = fixture();
        dedup_group(&f);
        f.registry.observe(&id("cap-2"), Tier::Capacity);
        f.registry.set_dedup_scope(&id("cap-2"), DedupScope::DiskGroup);
        f.registry
            .flag_evacuation(&id("cap-2"), EvacuationReason::Latency);

        assert!(f.controller.evacuate_all(&MonitorConfig::default()).await.is_empty());
        assert!(f.host.calls().is_empty());
    }
}
