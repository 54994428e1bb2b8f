//! Dedup space reclaim scheduling.
//!
//! Reclaim is a host-wide, one-way ratchet: `disabled` moves to `enabled`
//! when some disk group is large and full enough to need a scan, or straight
//! to `complete` when none does; `enabled` moves to `complete` once every
//! capacity device reports its scan finished.

use crate::events::{EventBus, MonitorEvent};
use crate::host::HostCommandInterface;
use anyhow::{Context, Result, bail};
use ddh_common::{DedupScope, DeviceId, DiskGroupMapping, ReclaimState, Tier};
use ddh_telemetry::TelemetrySource;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Capacity devices at or above this used fraction need reclaim.
pub const RECLAIM_USED_RATIO: f64 = 0.30;

/// Disk groups at or below 1.6 TiB cannot overflow dedup reference counts.
pub const RECLAIM_MIN_GROUP_BYTES: u64 = 1_759_218_604_441;

/// Why reclaim was found unnecessary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A caching device is not all-flash or not dedup enabled.
    NotDedupAllFlash,
    SmallDiskGroups,
    LowUsage,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::NotDedupAllFlash => "not_dedup_all_flash",
            Self::SmallDiskGroups => "small_disk_groups",
            Self::LowUsage => "low_usage",
        };
        write!(f, "{value}")
    }
}

/// What one reclaim step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimDecision {
    AlreadyComplete,
    /// A tier has no devices yet.
    WaitingForDevices,
    /// Marked complete without scanning.
    NotNeeded(SkipReason),
    Enabled,
    InProgress { complete: usize, total: usize },
    /// All scans finished; marked complete.
    Finished,
    /// The state change was rejected by the host; retried next cycle.
    Deferred(ReclaimState),
}

#[derive(Debug, Default)]
struct ReclaimProgress {
    completed: BTreeSet<DeviceId>,
    in_progress: BTreeSet<DeviceId>,
}

pub struct DedupSpaceReclaimScheduler {
    telemetry: Arc<dyn TelemetrySource>,
    host: Arc<dyn HostCommandInterface>,
    events: EventBus,
    progress: Mutex<ReclaimProgress>,
}

impl DedupSpaceReclaimScheduler {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        host: Arc<dyn HostCommandInterface>,
        events: EventBus,
    ) -> Self {
        Self {
            telemetry,
            host,
            events,
            progress: Mutex::new(ReclaimProgress::default()),
        }
    }

    /// Advance the reclaim state by at most one step.
    pub async fn run_once(&self, state: ReclaimState) -> Result<ReclaimDecision> {
        match state {
            ReclaimState::Complete => Ok(ReclaimDecision::AlreadyComplete),
            ReclaimState::Disabled => self.evaluate().await,
            ReclaimState::Enabled => self.track().await,
        }
    }

    async fn evaluate(&self) -> Result<ReclaimDecision> {
        let caching = self
            .telemetry
            .list_devices(Tier::Caching)
            .await
            .context("listing caching devices for reclaim")?;
        let capacity = self
            .telemetry
            .list_devices(Tier::Capacity)
            .await
            .context("listing capacity devices for reclaim")?;
        if caching.is_empty() || capacity.is_empty() {
            debug!("Dedup space reclaim waiting for devices");
            return Ok(ReclaimDecision::WaitingForDevices);
        }

        let skip = if !self.caching_devices_qualify(&caching).await? {
            Some(SkipReason::NotDedupAllFlash)
        } else if !self.has_large_disk_group(&caching).await? {
            Some(SkipReason::SmallDiskGroups)
        } else if !self.has_used_capacity_device(&capacity).await? {
            Some(SkipReason::LowUsage)
        } else {
            None
        };

        match skip {
            Some(reason) => {
                info!(%reason, "Dedup space reclaim not needed");
                Ok(self
                    .transition(ReclaimState::Disabled, ReclaimState::Complete)
                    .await
                    .unwrap_or(ReclaimDecision::NotNeeded(reason)))
            }
            None => {
                info!("Enabling dedup space reclaim");
                Ok(self
                    .transition(ReclaimState::Disabled, ReclaimState::Enabled)
                    .await
                    .unwrap_or(ReclaimDecision::Enabled))
            }
        }
    }

    /// Devices whose telemetry cannot be read are skipped for this cycle.
    /// Fails only when no caching device could be read.
    async fn caching_devices_qualify(&self, caching: &[DeviceId]) -> Result<bool> {
        let mut qualify = true;
        let mut readable = 0usize;
        for device in caching {
            let (state, dedup) = match tokio::try_join!(
                self.telemetry.device_state(device),
                self.telemetry.dedup_stats(device)
            ) {
                Ok(read) => read,
                Err(e) => {
                    warn!(device = %device, "Skipping device in reclaim check: {e}");
                    continue;
                }
            };
            readable += 1;
            if !state.all_flash {
                info!(device = %device, "Skipping reclaim: device is not all-flash");
                qualify = false;
            }
            if dedup.scope == DedupScope::None {
                info!(device = %device, "Skipping reclaim: device is not dedup enabled");
                qualify = false;
            }
        }
        ensure_readable(readable, Tier::Caching)?;
        Ok(qualify)
    }

    async fn has_large_disk_group(&self, caching: &[DeviceId]) -> Result<bool> {
        let mappings = self
            .telemetry
            .dedup_mappings()
            .await
            .context("reading dedup mappings for reclaim")?;
        let mut large = false;
        let mut readable = 0usize;
        for device in caching {
            let Some(bytes) = self.disk_group_capacity(device, &mappings).await else {
                continue;
            };
            readable += 1;
            info!(
                device = %device,
                capacity_gib = bytes as f64 / (1u64 << 30) as f64,
                "Disk group capacity"
            );
            if bytes > RECLAIM_MIN_GROUP_BYTES {
                large = true;
            }
        }
        ensure_readable(readable, Tier::Caching)?;
        Ok(large)
    }

    /// Total bytes of the disk group led by `caching`. `None` when the
    /// caching device is unreadable; unreadable capacity devices count as 0.
    async fn disk_group_capacity(
        &self,
        caching: &DeviceId,
        mappings: &[DiskGroupMapping],
    ) -> Option<u64> {
        let own = match self.telemetry.dedup_stats(caching).await {
            Ok(own) => own,
            Err(e) => {
                warn!(device = %caching, "Skipping disk group in reclaim check: {e}");
                return None;
            }
        };
        if own.scope == DedupScope::DiskGroup {
            return Some(own.total_bytes);
        }
        let mut total = 0u64;
        for mapping in mappings.iter().filter(|m| &m.caching == caching) {
            for child in &mapping.capacity {
                match self.telemetry.dedup_stats(child).await {
                    Ok(stats) => total = total.saturating_add(stats.total_bytes),
                    Err(e) => warn!(device = %child, "Skipping device in reclaim check: {e}"),
                }
            }
        }
        Some(total)
    }

    async fn has_used_capacity_device(&self, capacity: &[DeviceId]) -> Result<bool> {
        let mut used = 0usize;
        let mut readable = 0usize;
        for device in capacity {
            let stats = match self.telemetry.dedup_stats(device).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(device = %device, "Skipping device in reclaim check: {e}");
                    continue;
                }
            };
            readable += 1;
            let ratio = stats.used_ratio();
            debug!(device = %device, used_percent = ratio * 100.0, "Capacity consumed");
            if stats.total_bytes > 0 && ratio >= RECLAIM_USED_RATIO {
                used += 1;
            }
        }
        ensure_readable(readable, Tier::Capacity)?;
        if used > 0 {
            info!(
                used,
                total = capacity.len(),
                "Capacity devices above the reclaim usage threshold"
            );
        }
        Ok(used > 0)
    }

    async fn track(&self) -> Result<ReclaimDecision> {
        let capacity = self
            .telemetry
            .list_devices(Tier::Capacity)
            .await
            .context("listing capacity devices for reclaim")?;
        if capacity.is_empty() {
            debug!("Dedup space reclaim has no capacity devices to track");
            return Ok(ReclaimDecision::InProgress {
                complete: 0,
                total: 0,
            });
        }

        let mut complete = 0;
        for device in &capacity {
            let done = match self.telemetry.reclaim_complete(device).await {
                Ok(done) => done,
                Err(e) => {
                    debug!(device = %device, "Reclaim progress unavailable: {e}");
                    false
                }
            };
            self.note_progress(device, done);
            if done {
                complete += 1;
            }
        }

        if complete < capacity.len() {
            return Ok(ReclaimDecision::InProgress {
                complete,
                total: capacity.len(),
            });
        }

        info!(devices = capacity.len(), "Dedup space reclaim complete on all devices");
        match self
            .transition(ReclaimState::Enabled, ReclaimState::Complete)
            .await
        {
            Some(deferred) => Ok(deferred),
            None => {
                let mut progress = self.progress.lock();
                progress.completed.clear();
                progress.in_progress.clear();
                Ok(ReclaimDecision::Finished)
            }
        }
    }

    fn note_progress(&self, device: &DeviceId, done: bool) {
        let mut progress = self.progress.lock();
        if done {
            if progress.completed.insert(device.clone()) {
                progress.in_progress.remove(device);
                info!(device = %device, "Dedup space reclaim complete");
            }
        } else if progress.in_progress.insert(device.clone()) {
            info!(device = %device, "Dedup space reclaim in progress");
        }
    }

    /// Apply a state change. `Some` carries the deferred decision on failure.
    async fn transition(&self, from: ReclaimState, to: ReclaimState) -> Option<ReclaimDecision> {
        if let Err(e) = self.host.set_reclaim_state(to).await {
            warn!(%from, %to, "Failed to change dedup space reclaim state: {e}");
            return Some(ReclaimDecision::Deferred(to));
        }
        self.events
            .publish(&MonitorEvent::ReclaimStateChanged { from, to });
        None
    }
}

/// Defer the decision when no device of `tier` could be read.
fn ensure_readable(readable: usize, tier: Tier) -> Result<()> {
    if readable == 0 {
        bail!("no {tier} device readable for reclaim");
    }
    Ok(())
}
