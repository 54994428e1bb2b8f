//! Device registry: the arena of [`Device`] records plus shared health sets.
//!
//! Dedup disk groups are kept as an index (`parent_of` / `children_of`)
//! rebuilt from telemetry, never as references between devices. All access
//! goes through one mutex; callers must not hold results across awaits.

use crate::device::Device;
use ddh_common::{DedupScope, DeviceId, DiskGroupMapping, Tier};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tokio::time::Instant;

/// Why a device was queued for evacuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvacuationReason {
    Latency,
    Congestion,
    LogCongestion,
    PrepareLatency,
}

impl std::fmt::Display for EvacuationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Latency => "latency",
            Self::Congestion => "congestion",
            Self::LogCongestion => "log_congestion",
            Self::PrepareLatency => "prepare_latency",
        };
        write!(f, "{value}")
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capacity device {device} is in a dedup disk group with no known caching device")]
    MissingDedupParent { device: DeviceId },

    #[error("device {0} has not been enumerated")]
    UnknownDevice(DeviceId),
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<DeviceId, Device>,
    dedup_scopes: HashMap<DeviceId, DedupScope>,
    parent_of: HashMap<DeviceId, DeviceId>,
    children_of: HashMap<DeviceId, Vec<DeviceId>>,
    /// Half-threshold latency warnings.
    degrading: BTreeSet<DeviceId>,
    smart_degraded: BTreeSet<DeviceId>,
    evacuate: BTreeMap<DeviceId, EvacuationReason>,
    congestion_watched: HashSet<DeviceId>,
    attribute_warned: HashSet<DeviceId>,
    failed_caching: Vec<DeviceId>,
    failed_capacity: Vec<DeviceId>,
}

impl RegistryInner {
    fn owner_of(&self, id: &DeviceId) -> Result<DeviceId, RegistryError> {
        let device = self
            .devices
            .get(id)
            .ok_or_else(|| RegistryError::UnknownDevice(id.clone()))?;
        let dedup = self.dedup_scopes.get(id).copied().unwrap_or_default();
        if device.tier == Tier::Capacity && dedup == DedupScope::DiskGroup {
            return self
                .parent_of
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::MissingDedupParent { device: id.clone() });
        }
        Ok(id.clone())
    }

    fn failed_list(&mut self, tier: Tier) -> &mut Vec<DeviceId> {
        match tier {
            Tier::Caching => &mut self.failed_caching,
            Tier::Capacity => &mut self.failed_capacity,
        }
    }
}

/// Shared device state of the monitor.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the device on first sight.
    pub fn observe(&self, id: &DeviceId, tier: Tier) {
        let mut inner = self.inner.lock();
        inner
            .devices
            .entry(id.clone())
            .and_modify(|device| device.tier = tier)
            .or_insert_with(|| Device::new(id.clone(), tier));
    }

    pub fn tier_of(&self, id: &DeviceId) -> Option<Tier> {
        self.inner.lock().devices.get(id).map(|device| device.tier)
    }

    /// Run `f` on a device. `None` when the device is unknown.
    pub fn with_device<R>(&self, id: &DeviceId, f: impl FnOnce(&mut Device) -> R) -> Option<R> {
        self.inner.lock().devices.get_mut(id).map(f)
    }

    #[cfg(test)]
    pub fn snapshot(&self, id: &DeviceId) -> Option<Device> {
        self.inner.lock().devices.get(id).cloned()
    }

    // ========================================================================
    // Dedup topology
    // ========================================================================

    pub fn set_dedup_scope(&self, id: &DeviceId, scope: DedupScope) {
        self.inner.lock().dedup_scopes.insert(id.clone(), scope);
    }

    /// Rebuild the disk-group index. Only capacity devices in disk-group
    /// dedup scope are mapped to their caching device.
    pub fn rebuild_dedup_index(&self, mappings: &[DiskGroupMapping]) {
        let mut inner = self.inner.lock();
        let mut parent_of = HashMap::new();
        let mut children_of: HashMap<DeviceId, Vec<DeviceId>> = HashMap::new();
        for mapping in mappings {
            for child in &mapping.capacity {
                let scope = inner.dedup_scopes.get(child).copied().unwrap_or_default();
                if scope == DedupScope::DiskGroup {
                    parent_of.insert(child.clone(), mapping.caching.clone());
                    children_of
                        .entry(mapping.caching.clone())
                        .or_default()
                        .push(child.clone());
                }
            }
        }
        inner.parent_of = parent_of;
        inner.children_of = children_of;
    }

    pub fn is_mapped(&self, id: &DeviceId) -> bool {
        self.inner.lock().parent_of.contains_key(id)
    }

    pub fn children_of(&self, id: &DeviceId) -> Vec<DeviceId> {
        self.inner
            .lock()
            .children_of
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Device that owns failure handling for `id`: the caching device for a
    /// capacity device in a dedup disk group, otherwise `id` itself.
    pub fn owner_of(&self, id: &DeviceId) -> Result<DeviceId, RegistryError> {
        self.inner.lock().owner_of(id)
    }

    // ========================================================================
    // Health sets
    // ========================================================================

    /// Returns `true` when the device was not already degrading.
    pub fn mark_degrading(&self, id: &DeviceId) -> bool {
        self.inner.lock().degrading.insert(id.clone())
    }

    pub fn clear_degrading(&self, id: &DeviceId) -> bool {
        self.inner.lock().degrading.remove(id)
    }

    #[cfg(test)]
    pub fn is_degrading(&self, id: &DeviceId) -> bool {
        self.inner.lock().degrading.contains(id)
    }

    pub fn mark_smart_degraded(&self, id: &DeviceId) -> bool {
        self.inner.lock().smart_degraded.insert(id.clone())
    }

    #[cfg(test)]
    pub fn is_smart_degraded(&self, id: &DeviceId) -> bool {
        self.inner.lock().smart_degraded.contains(id)
    }

    /// Latency or SMART already flagged the device.
    pub fn has_high_latency(&self, id: &DeviceId) -> bool {
        let inner = self.inner.lock();
        inner.degrading.contains(id) || inner.smart_degraded.contains(id)
    }

    /// Drop degradation marks of a device that left the pool.
    pub fn forget_degradation(&self, id: &DeviceId) {
        let mut inner = self.inner.lock();
        inner.degrading.remove(id);
        inner.smart_degraded.remove(id);
    }

    /// Queue a device for evacuation. The first reason is kept.
    pub fn flag_evacuation(&self, id: &DeviceId, reason: EvacuationReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.evacuate.contains_key(id) {
            return false;
        }
        inner.evacuate.insert(id.clone(), reason);
        true
    }

    #[cfg(test)]
    pub fn pending_evacuations(&self) -> Vec<(DeviceId, EvacuationReason)> {
        self.inner
            .lock()
            .evacuate
            .iter()
            .map(|(id, reason)| (id.clone(), *reason))
            .collect()
    }

    /// Drain the evacuation queue.
    pub fn take_evacuations(&self) -> Vec<(DeviceId, EvacuationReason)> {
        std::mem::take(&mut self.inner.lock().evacuate)
            .into_iter()
            .collect()
    }

    /// Returns `false` when a watch is already running for the device.
    pub fn begin_congestion_watch(&self, id: &DeviceId) -> bool {
        self.inner.lock().congestion_watched.insert(id.clone())
    }

    pub fn end_congestion_watch(&self, id: &DeviceId) {
        self.inner.lock().congestion_watched.remove(id);
    }

    #[cfg(test)]
    pub fn is_congestion_watched(&self, id: &DeviceId) -> bool {
        self.inner.lock().congestion_watched.contains(id)
    }

    /// Returns `true` the first time a misconfiguration is reported.
    pub fn warn_attribute_once(&self, id: &DeviceId) -> bool {
        self.inner.lock().attribute_warned.insert(id.clone())
    }

    pub fn clear_attribute_warning(&self, id: &DeviceId) -> bool {
        self.inner.lock().attribute_warned.remove(id)
    }

    // ========================================================================
    // Failed devices
    // ========================================================================

    /// Put a failure owner in its tier's failed list and start an episode.
    pub fn enter_failed(&self, owner: &DeviceId, now: Instant) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        let device = inner
            .devices
            .get_mut(owner)
            .ok_or_else(|| RegistryError::UnknownDevice(owner.clone()))?;
        if !device.enter_failed(now) {
            return Ok(false);
        }
        let tier = device.tier;
        let list = inner.failed_list(tier);
        if !list.contains(owner) {
            list.push(owner.clone());
        }
        Ok(true)
    }

    /// Leave the failed list after a confirmed recovery.
    pub fn confirm_healthy(&self, owner: &DeviceId) {
        let mut inner = self.inner.lock();
        if let Some(device) = inner.devices.get_mut(owner) {
            device.confirm_healthy();
        }
        inner.failed_caching.retain(|id| id != owner);
        inner.failed_capacity.retain(|id| id != owner);
    }

    /// Leave the failed list after a successful remount.
    pub fn record_remount_success(&self, owner: &DeviceId) {
        let mut inner = self.inner.lock();
        if let Some(device) = inner.devices.get_mut(owner) {
            device.record_remount_success();
        }
        inner.failed_caching.retain(|id| id != owner);
        inner.failed_capacity.retain(|id| id != owner);
    }

    /// Failed owners, caching tier first.
    pub fn failed_devices(&self) -> Vec<DeviceId> {
        let inner = self.inner.lock();
        inner
            .failed_caching
            .iter()
            .chain(inner.failed_capacity.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RemountState;

    fn id(name: &str) -> DeviceId {
        DeviceId::new(name)
    }

    fn dedup_group() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.observe(&id("cache-1"), Tier::Caching);
        registry.observe(&id("cap-1"), Tier::Capacity);
        registry.observe(&id("cap-2"), Tier::Capacity);
        registry.set_dedup_scope(&id("cache-1"), DedupScope::DiskGroup);
        registry.set_dedup_scope(&id("cap-1"), DedupScope::DiskGroup);
        registry.set_dedup_scope(&id("cap-2"), DedupScope::DiskGroup);
        registry.rebuild_dedup_index(&[DiskGroupMapping {
            caching: id("cache-1"),
            capacity: vec![id("cap-1"), id("cap-2")],
        }]);
        registry
    }

    #[test]
    fn observe_creates_devices_lazily_once() {
        let registry = DeviceRegistry::new();
        registry.observe(&id("cap-1"), Tier::Capacity);
        registry.with_device(&id("cap-1"), |d| d.remount_attempts = 3);
        registry.observe(&id("cap-1"), Tier::Capacity);

        let device = registry.snapshot(&id("cap-1")).unwrap();
        assert_eq!(device.remount_attempts, 3);
        assert!(registry.with_device(&id("missing"), |_| ()).is_none());
    }

    #[test]
    fn mapped_capacity_device_resolves_to_caching_owner() {
        let registry = dedup_group();
        assert_eq!(registry.owner_of(&id("cap-1")).unwrap(), id("cache-1"));
        assert_eq!(registry.owner_of(&id("cache-1")).unwrap(), id("cache-1"));
        assert!(registry.is_mapped(&id("cap-2")));
        assert_eq!(registry.children_of(&id("cache-1")), vec![id("cap-1"), id("cap-2")]);
    }

    #[test]
    fn unmapped_dedup_capacity_device_is_an_invariant_error() {
        let registry = dedup_group();
        registry.observe(&id("cap-9"), Tier::Capacity);
        registry.set_dedup_scope(&id("cap-9"), DedupScope::DiskGroup);
        assert_eq!(
            registry.owner_of(&id("cap-9")),
            Err(RegistryError::MissingDedupParent { device: id("cap-9") })
        );
    }

    #[test]
    fn non_dedup_capacity_device_owns_itself() {
        let registry = DeviceRegistry::new();
        registry.observe(&id("cap-1"), Tier::Capacity);
        registry.rebuild_dedup_index(&[DiskGroupMapping {
            caching: id("cache-1"),
            capacity: vec![id("cap-1")],
        }]);
        assert_eq!(registry.owner_of(&id("cap-1")).unwrap(), id("cap-1"));
        assert!(!registry.is_mapped(&id("cap-1")));
    }

    #[test]
    fn evacuation_queue_deduplicates_and_drains() {
        let registry = DeviceRegistry::new();
        assert!(registry.flag_evacuation(&id("cap-1"), EvacuationReason::Latency));
        assert!(!registry.flag_evacuation(&id("cap-1"), EvacuationReason::Congestion));

        let drained = registry.take_evacuations();
        assert_eq!(drained, vec![(id("cap-1"), EvacuationReason::Latency)]);
        assert!(registry.pending_evacuations().is_empty());
    }

    #[test]
    fn congestion_watch_is_exclusive() {
        let registry = DeviceRegistry::new();
        assert!(registry.begin_congestion_watch(&id("cache-1")));
        assert!(!registry.begin_congestion_watch(&id("cache-1")));
        registry.end_congestion_watch(&id("cache-1"));
        assert!(registry.begin_congestion_watch(&id("cache-1")));
    }

    #[test]
    fn failed_list_tracks_episode_owner() {
        let registry = dedup_group();
        let now = Instant::now();
        assert!(registry.enter_failed(&id("cache-1"), now).unwrap());
        assert!(!registry.enter_failed(&id("cache-1"), now).unwrap());
        assert_eq!(registry.failed_devices(), vec![id("cache-1")]);

        registry.record_remount_success(&id("cache-1"));
        assert!(registry.failed_devices().is_empty());
        let device = registry.snapshot(&id("cache-1")).unwrap();
        assert_eq!(device.remount, RemountState::Healthy);
        assert_eq!(device.successful_remount_attempts, 1);
    }

    #[test]
    fn high_latency_covers_degrading_and_smart() {
        let registry = DeviceRegistry::new();
        assert!(!registry.has_high_latency(&id("a")));
        registry.mark_smart_degraded(&id("a"));
        assert!(registry.has_high_latency(&id("a")));
        registry.forget_degradation(&id("a"));
        assert!(!registry.has_high_latency(&id("a")));
        assert!(registry.mark_degrading(&id("b")));
        assert!(!registry.mark_degrading(&id("b")));
        assert!(registry.has_high_latency(&id("b")));
    }
}
