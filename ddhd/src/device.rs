//! Per-device health state and the remount throttling state machine.

use crate::latency::LatencyWindow;
use crate::log_health::LogWindow;
use ddh_common::{DeviceId, Tier};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Successful remounts allowed before a device is throttled for good.
pub const MAX_REMOUNT_ATTEMPTS: u32 = 10;

/// Where a device stands in the remount state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemountState {
    Healthy,
    /// Failed and eligible for remount attempts.
    FailedUnthrottled,
    /// Failed; no further remounts until the device is seen healthy again.
    FailedThrottled,
}

impl std::fmt::Display for RemountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Healthy => "healthy",
            Self::FailedUnthrottled => "failed_unthrottled",
            Self::FailedThrottled => "failed_throttled",
        };
        write!(f, "{value}")
    }
}

/// Why remounting stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    WindowElapsed,
    SuccessCap,
}

impl std::fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::WindowElapsed => "window_elapsed",
            Self::SuccessCap => "success_cap",
        };
        write!(f, "{value}")
    }
}

/// Decision for one remount pass over a failed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountPlan {
    Attempt { last_attempt: bool },
    Throttle(ThrottleReason),
}

/// One physical device known to the pool.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub tier: Tier,
    pub remount: RemountState,
    /// Remount passes since the current failure episode began.
    pub remount_attempts: u32,
    pub successful_remount_attempts: u32,
    pub fail_start: Option<Instant>,
    pub latency: LatencyWindow,
    pub log: LogWindow,
}

impl Device {
    pub fn new(id: DeviceId, tier: Tier) -> Self {
        Self {
            id,
            tier,
            remount: RemountState::Healthy,
            remount_attempts: 0,
            successful_remount_attempts: 0,
            fail_start: None,
            latency: LatencyWindow::default(),
            log: LogWindow::default(),
        }
    }

    pub fn is_remountable(&self) -> bool {
        self.remount != RemountState::FailedThrottled
    }

    /// Start a failure episode. Returns `false` when one is already running.
    pub fn enter_failed(&mut self, now: Instant) -> bool {
        if self.remount != RemountState::Healthy {
            return false;
        }
        self.remount = RemountState::FailedUnthrottled;
        self.fail_start = Some(now);
        self.remount_attempts = 0;
        true
    }

    /// The device was seen mounted and healthy while in the failed set.
    pub fn confirm_healthy(&mut self) {
        self.remount = RemountState::Healthy;
        self.remount_attempts = 0;
        self.successful_remount_attempts = 0;
        self.fail_start = None;
    }

    /// Count a remount pass and decide whether to attempt it.
    ///
    /// Throttles the device when the success cap is reached or the remount
    /// window since the failure started has elapsed.
    pub fn plan_remount(&mut self, now: Instant, window: Duration, poll: Duration) -> RemountPlan {
        self.remount_attempts += 1;

        let reason = if self.successful_remount_attempts >= MAX_REMOUNT_ATTEMPTS {
            ThrottleReason::SuccessCap
        } else {
            let elapsed = self
                .fail_start
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default();
            if elapsed < window {
                return RemountPlan::Attempt {
                    last_attempt: elapsed + poll * 2 >= window,
                };
            }
            ThrottleReason::WindowElapsed
        };
        self.remount = RemountState::FailedThrottled;
        RemountPlan::Throttle(reason)
    }

    /// A remount succeeded. The episode ends; the success tally is kept so
    /// a device that keeps failing is eventually throttled.
    pub fn record_remount_success(&mut self) {
        self.successful_remount_attempts += 1;
        self.remount = RemountState::Healthy;
        self.fail_start = None;
    }

    /// Clear diagnosis counters after an evacuation request.
    pub fn reset_diagnostics(&mut self) {
        self.latency.reset();
        self.log.reset_baselines();
    }
}
