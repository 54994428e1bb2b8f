//! Remounting of failed devices.
//!
//! A failed capacity device in a dedup disk group is handled through its
//! caching device: the whole group is unmounted and mounted again. Attempts
//! happen once per cycle and are throttled by a time window and a cap on
//! successful remounts.

use crate::device::{RemountPlan, ThrottleReason};
use crate::events::{EventBus, MonitorEvent};
use crate::host::{CommandError, HostCommandInterface};
use crate::registry::{DeviceRegistry, RegistryError};
use ddh_common::{DeviceId, MonitorConfig, Tier};
use ddh_telemetry::TelemetrySource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one remount pass over a failed owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountOutcome {
    /// The owner was found serving again and left the failed list.
    Recovered,
    Remounted,
    /// Unmount or mount did not take effect; retried next cycle.
    Failed,
    /// Remounting stopped on this pass.
    Throttled(ThrottleReason),
    /// Already throttled; waiting for an external recovery.
    Waiting,
}

pub struct RemountController {
    telemetry: Arc<dyn TelemetrySource>,
    host: Arc<dyn HostCommandInterface>,
    registry: Arc<DeviceRegistry>,
    events: EventBus,
}

impl RemountController {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        host: Arc<dyn HostCommandInterface>,
        registry: Arc<DeviceRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            telemetry,
            host,
            registry,
            events,
        }
    }

    /// Record a failed device. The failure episode belongs to the owner.
    pub fn mark_failed(&self, device: &DeviceId, now: Instant) -> Result<bool, RegistryError> {
        let owner = self.registry.owner_of(device)?;
        let started = self.registry.enter_failed(&owner, now)?;
        if started {
            warn!(device = %device, owner = %owner, "Device failed; eligible for remount");
        }
        Ok(started)
    }

    /// One remount pass over every failed owner, caching tier first.
    pub async fn remount_all(&self, config: &MonitorConfig) -> Vec<(DeviceId, RemountOutcome)> {
        if !config.remount_after_failed {
            return Vec::new();
        }
        let mut outcomes = Vec::new();
        for owner in self.registry.failed_devices() {
            let outcome = self.remount_device(&owner, config).await;
            debug!(device = %owner, ?outcome, "Remount pass");
            outcomes.push((owner, outcome));
        }
        outcomes
    }

    pub async fn remount_device(&self, owner: &DeviceId, config: &MonitorConfig) -> RemountOutcome {
        if self.is_remounted(owner).await {
            info!(device = %owner, "Failed device is serving again");
            self.registry.confirm_healthy(owner);
            self.events.publish(&MonitorEvent::RemountRecovered {
                device: owner.clone(),
            });
            return RemountOutcome::Recovered;
        }

        let window = Duration::from_secs(config.remount_window_secs);
        let poll = config.poll_interval();
        let now = Instant::now();
        let Some((tier, plan)) = self.registry.with_device(owner, |d| {
            let plan = d.is_remountable().then(|| d.plan_remount(now, window, poll));
            (d.tier, plan)
        }) else {
            return RemountOutcome::Waiting;
        };

        let last_attempt = match plan {
            None => return RemountOutcome::Waiting,
            Some(RemountPlan::Throttle(reason)) => {
                let (attempts, successes) = self
                    .registry
                    .with_device(owner, |d| (d.remount_attempts, d.successful_remount_attempts))
                    .unwrap_or_default();
                warn!(
                    device = %owner,
                    %reason,
                    unsuccessful_attempts = attempts.saturating_sub(1),
                    successful_attempts = successes,
                    "Not remounting failed device; throttled"
                );
                self.events.publish(&MonitorEvent::RemountThrottled {
                    device: owner.clone(),
                    reason,
                });
                return RemountOutcome::Throttled(reason);
            }
            Some(RemountPlan::Attempt { last_attempt }) => last_attempt,
        };

        let attempt = self
            .registry
            .with_device(owner, |d| d.remount_attempts)
            .unwrap_or_default();

        if !self.unmount(owner, tier, attempt, last_attempt).await {
            return RemountOutcome::Failed;
        }
        if !self.mount(owner, tier, attempt, last_attempt).await {
            return RemountOutcome::Failed;
        }
        self.registry.record_remount_success(owner);
        RemountOutcome::Remounted
    }

    /// Owner serving, and for a caching owner every child serving too.
    async fn is_remounted(&self, owner: &DeviceId) -> bool {
        if !self.is_serving(owner).await {
            return false;
        }
        for child in self.group_members(owner) {
            if !self.is_serving(&child).await {
                return false;
            }
        }
        true
    }

    /// Owner unmounted, and for a caching owner every child unmounted too.
    async fn is_unmounted(&self, owner: &DeviceId) -> bool {
        if self.is_mounted(owner).await {
            return false;
        }
        for child in self.group_members(owner) {
            if self.is_mounted(&child).await {
                return false;
            }
        }
        true
    }

    fn group_members(&self, owner: &DeviceId) -> Vec<DeviceId> {
        match self.registry.tier_of(owner) {
            Some(Tier::Caching) => self.registry.children_of(owner),
            _ => Vec::new(),
        }
    }

    async fn is_serving(&self, device: &DeviceId) -> bool {
        match self.telemetry.health(device).await {
            Ok(health) => health.is_serving(),
            Err(e) => {
                debug!(device = %device, "Health unavailable: {e}");
                false
            }
        }
    }

    /// Unknown health counts as mounted so no remount proceeds blind.
    async fn is_mounted(&self, device: &DeviceId) -> bool {
        match self.telemetry.health(device).await {
            Ok(health) => health.mounted,
            Err(e) => {
                debug!(device = %device, "Health unavailable: {e}");
                true
            }
        }
    }

    async fn unmount(&self, owner: &DeviceId, tier: Tier, attempt: u32, last_attempt: bool) -> bool {
        match self.host.unmount(owner, tier).await {
            Ok(()) => {}
            Err(CommandError::AlreadyUnmounted { .. }) => {
                debug!(device = %owner, "Device was already unmounted");
            }
            Err(e) => warn!(device = %owner, attempt, "Unmount command failed: {e}"),
        }

        let success = self.is_unmounted(owner).await;
        if success {
            info!(device = %owner, %tier, attempt, "Unmounted failed device");
            self.registry.forget_degradation(owner);
        } else if last_attempt {
            warn!(device = %owner, %tier, attempt, "Unmount failed; giving up");
        } else {
            warn!(device = %owner, %tier, attempt, "Unmount failed");
        }
        self.events.publish(&MonitorEvent::Unmounted {
            device: owner.clone(),
            success,
        });
        success
    }

    async fn mount(&self, owner: &DeviceId, tier: Tier, attempt: u32, last_attempt: bool) -> bool {
        let command_ok = match self.host.mount(owner, tier).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %owner, attempt, "Mount command failed: {e}");
                false
            }
        };

        let success = command_ok && self.is_serving(owner).await;
        if success {
            info!(device = %owner, %tier, attempt, "Remounted failed device");
        } else if last_attempt {
            warn!(device = %owner, %tier, attempt, "Remount failed; giving up");
        } else {
            warn!(device = %owner, %tier, attempt, "Remount failed");
        }
        self.events.publish(&MonitorEvent::Remounted {
            device: owner.clone(),
            success,
            last_attempt,
        });
        success
    }
}
