//! Randomized latency sampling.
//!
//! Each sampling period is split into fixed intervals (one per poll). At the
//! start of a period a random subset of interval ordinals is drawn, with no
//! two ordinals adjacent. A write-latency exceedance only counts towards an
//! evacuation verdict when it lands on a sampled ordinal that is not adjacent
//! to the previously counted one, so short bursts of slowness cannot convict
//! a device on their own.

use ddh_common::{IoLatencyStats, MonitorConfig};
use serde::Serialize;

/// Minimum intervals per period for each required exceedance.
pub const INTERVALS_PER_EXCEEDANCE: u32 = 5;

/// Sampled ordinals drawn for each required exceedance.
pub const SAMPLES_PER_EXCEEDANCE: u32 = 3;

/// IO direction of a latency observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    Read,
    Write,
}

impl std::fmt::Display for IoDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Self::Read => "read",
            Self::Write => "write",
        };
        write!(f, "{value}")
    }
}

/// Period geometry derived from the monitor policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Counted exceedances per period that convict a device. Zero disables.
    pub exceed_count: u32,
    /// Intervals in one period.
    pub intervals: u32,
}

impl SamplerConfig {
    pub fn from_monitor(config: &MonitorConfig) -> Self {
        let poll = config.poll_interval_secs.max(1);
        let per_period = (u64::from(config.latency_time_period_mins) * 60 / poll).max(1);
        let floor = u64::from(config.latency_interval_count) * u64::from(INTERVALS_PER_EXCEEDANCE);
        let intervals = u32::try_from(per_period.max(floor)).unwrap_or(u32::MAX);
        Self {
            exceed_count: config.latency_interval_count,
            intervals,
        }
    }

    /// Size of the sampled subset, capped so a non-adjacent subset exists.
    pub fn sample_size(&self) -> u32 {
        self.exceed_count
            .saturating_mul(SAMPLES_PER_EXCEEDANCE)
            .min(self.intervals.div_ceil(2))
    }
}

/// Per-device sampling state for the current period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyWindow {
    /// Ordinal of the next tracked interval in the period.
    pub interval_count: u32,
    /// Exceedances counted towards the verdict this period.
    pub exceeded_count: u32,
    pub most_recent_exceeded: u32,
    /// Sorted, pairwise non-adjacent ordinals.
    pub sampled: Vec<u32>,
}

impl LatencyWindow {
    /// Start over with a fresh period on the next tracked interval.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of one latency observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// Not enough IO in the interval to judge it.
    Untracked,
    Healthy,
    /// Latency exceeded the threshold. `counted` when it moved the verdict.
    Exceeded {
        counted: bool,
        exceeded: u32,
        required: u32,
    },
    MustEvacuate { exceeded: u32, required: u32 },
}

/// Position of an interval's average latency relative to the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdBand {
    /// At or below half the threshold.
    Low,
    /// Above half the threshold but below it.
    Degrading,
    /// At or above the threshold.
    High,
}

pub fn threshold_band(stats: &IoLatencyStats) -> ThresholdBand {
    if stats.threshold_us == 0 || stats.max_average_latency_us <= stats.half_threshold_us() {
        ThresholdBand::Low
    } else if stats.max_average_latency_us < stats.threshold_us {
        ThresholdBand::Degrading
    } else {
        ThresholdBand::High
    }
}

/// Draw `size` sorted ordinals from `0..intervals` with no two adjacent.
///
/// Picks a uniform `size`-subset of `0..intervals - size + 1`, sorts it and
/// spreads it by adding each element's rank, which maps subsets one-to-one
/// onto non-adjacent subsets of the full range.
pub fn draw_non_adjacent(rng: &mut fastrand::Rng, intervals: u32, size: u32) -> Vec<u32> {
    let size = size.min(intervals.div_ceil(2));
    if size == 0 {
        return Vec::new();
    }
    let span = intervals - size + 1;
    let mut pool: Vec<u32> = (0..span).collect();
    rng.shuffle(&mut pool);
    pool.truncate(size as usize);
    pool.sort_unstable();
    pool.iter()
        .zip(0u32..)
        .map(|(ordinal, rank)| ordinal + rank)
        .collect()
}

/// Write-latency verdict engine.
#[derive(Debug)]
pub struct LatencyHealthSampler {
    rng: fastrand::Rng,
}

impl Default for LatencyHealthSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHealthSampler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// Deterministic sampler for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Feed one write-latency interval into the device's window.
    pub fn observe_write(
        &mut self,
        window: &mut LatencyWindow,
        stats: &IoLatencyStats,
        config: SamplerConfig,
    ) -> HealthSignal {
        if !stats.exceeded() && !stats.has_sufficient_io() {
            return HealthSignal::Untracked;
        }

        if window.interval_count == 0 {
            window.most_recent_exceeded = 0;
            window.sampled =
                draw_non_adjacent(&mut self.rng, config.intervals, config.sample_size());
        }

        let mut signal = HealthSignal::Healthy;
        if stats.exceeded() {
            let ordinal = window.interval_count;
            let counted = config.exceed_count > 0
                && window.sampled.binary_search(&ordinal).is_ok()
                && (ordinal > window.most_recent_exceeded + 1 || window.exceeded_count == 0);
            if counted {
                window.exceeded_count += 1;
                window.most_recent_exceeded = ordinal;
            }
            signal = if config.exceed_count > 0 && window.exceeded_count >= config.exceed_count {
                HealthSignal::MustEvacuate {
                    exceeded: window.exceeded_count,
                    required: config.exceed_count,
                }
            } else {
                HealthSignal::Exceeded {
                    counted,
                    exceeded: window.exceeded_count,
                    required: config.exceed_count,
                }
            };
        }

        window.interval_count += 1;
        if window.interval_count >= config.intervals {
            window.interval_count = 0;
            window.exceeded_count = 0;
        }
        signal
    }

    /// Read latency is informational: it never advances a verdict.
    pub fn observe_read(stats: &IoLatencyStats) -> HealthSignal {
        if stats.exceeded() {
            HealthSignal::Exceeded {
                counted: false,
                exceeded: 0,
                required: 0,
            }
        } else if stats.has_sufficient_io() {
            HealthSignal::Healthy
        } else {
            HealthSignal::Untracked
        }
    }
}
