//! Test doubles for the daemon.

use crate::host::{CommandError, HostCommandInterface};
use async_trait::async_trait;
use ddh_common::{DeviceHealth, DeviceId, EvacuationEvent, HealthFlags, ReclaimState, Tier};
use ddh_telemetry::mock::MockTelemetry;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A host command as seen by [`MockHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Mount(DeviceId, Tier),
    Unmount(DeviceId, Tier),
    Evacuate(DeviceId, EvacuationEvent),
    SetReclaimState(ReclaimState),
    ResetLatencyStats(DeviceId),
}

#[derive(Debug, Default)]
struct MockHostState {
    calls: Vec<HostCall>,
    groups: HashMap<DeviceId, Vec<DeviceId>>,
    failing: HashSet<&'static str>,
    mount_leaves_failed: bool,
}

/// Records host commands and applies their effects to a [`MockTelemetry`].
#[derive(Debug)]
pub struct MockHost {
    telemetry: Arc<MockTelemetry>,
    state: Mutex<MockHostState>,
}

impl MockHost {
    pub fn new(telemetry: Arc<MockTelemetry>) -> Self {
        Self {
            telemetry,
            state: Mutex::new(MockHostState::default()),
        }
    }

    /// Capacity devices unmounted and mounted together with `caching`.
    pub fn set_group(&self, caching: &DeviceId, members: Vec<DeviceId>) {
        self.state.lock().groups.insert(caching.clone(), members);
    }

    /// Make every call of `action` fail without side effects.
    pub fn fail_action(&self, action: &'static str) {
        self.state.lock().failing.insert(action);
    }

    pub fn mount_leaves_failed(&self, leaves_failed: bool) {
        self.state.lock().mount_leaves_failed = leaves_failed;
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn evacuations(&self) -> Vec<(DeviceId, EvacuationEvent)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::Evacuate(device, event) => Some((device, event)),
                _ => None,
            })
            .collect()
    }

    pub fn reclaim_states(&self) -> Vec<ReclaimState> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                HostCall::SetReclaimState(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    fn record(&self, action: &'static str, call: HostCall) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing.contains(action) {
            return Err(CommandError::Failed {
                action,
                status: "exit status: 1".to_string(),
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn set_group_health(&self, device: &DeviceId, health: DeviceHealth) {
        let members = self
            .state
            .lock()
            .groups
            .get(device)
            .cloned()
            .unwrap_or_default();
        self.telemetry.set_health(device, health);
        for member in &members {
            self.telemetry.set_health(member, health);
        }
    }
}

#[async_trait]
impl HostCommandInterface for MockHost {
    async fn mount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError> {
        self.record("mount", HostCall::Mount(device.clone(), tier))?;
        let health = if self.state.lock().mount_leaves_failed {
            DeviceHealth::mounted(HealthFlags::FAILED)
        } else {
            DeviceHealth::mounted(0)
        };
        self.set_group_health(device, health);
        Ok(())
    }

    async fn unmount(&self, device: &DeviceId, tier: Tier) -> Result<(), CommandError> {
        self.record("unmount", HostCall::Unmount(device.clone(), tier))?;
        self.set_group_health(device, DeviceHealth::unmounted());
        Ok(())
    }

    async fn evacuate(
        &self,
        device: &DeviceId,
        event: EvacuationEvent,
    ) -> Result<(), CommandError> {
        self.record("evacuate", HostCall::Evacuate(device.clone(), event))
    }

    async fn set_reclaim_state(&self, state: ReclaimState) -> Result<(), CommandError> {
        self.record("set_reclaim_state", HostCall::SetReclaimState(state))?;
        self.telemetry
            .update_config(|config| config.dedup_space_reclaim = state);
        Ok(())
    }

    async fn reset_latency_stats(&self, device: &DeviceId) -> Result<(), CommandError> {
        self.record(
            "reset_latency_stats",
            HostCall::ResetLatencyStats(device.clone()),
        )
    }
}
