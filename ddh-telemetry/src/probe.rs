//! Telemetry backed by an external probe program.
//!
//! Each query runs `<probe> <query> [argument]` and decodes the versioned JSON
//! envelope the probe prints on stdout (see [`crate::schema`]).

use crate::schema::{self, check_congestion};
use crate::{Query, TelemetryError, TelemetrySource};
use async_trait::async_trait;
use ddh_common::{
    DedupStats, DeviceHealth, DeviceId, DeviceState, DiskGroupMapping, LatencyStats,
    LogPositions, MonitorConfig, PrepareLatency, SmartCounters, Tier,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Default probe program, looked up on `PATH`.
pub const DEFAULT_PROBE: &str = "ddh-probe";

/// Default upper bound for a single probe invocation.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stderr kept in error messages.
const MAX_STDERR_CHARS: usize = 512;

/// [`TelemetrySource`] that shells out to a probe program.
#[derive(Debug, Clone)]
pub struct ProbeTelemetrySource {
    program: PathBuf,
    timeout: Duration,
}

impl ProbeTelemetrySource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn query<T: DeserializeOwned>(
        &self,
        query: Query,
        argument: Option<&str>,
    ) -> Result<T, TelemetryError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg(query.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(argument) = argument {
            command.arg(argument);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TelemetryError::Timeout {
                query: query.as_str(),
                timeout: self.timeout,
            })?
            .map_err(|source| TelemetryError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TelemetryError::ProbeFailed {
                query: query.as_str(),
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(MAX_STDERR_CHARS).collect(),
            });
        }

        debug!(
            query = %query,
            argument = argument.unwrap_or(""),
            bytes = output.stdout.len(),
            "Probe query completed"
        );
        schema::decode(query, &output.stdout)
    }

    async fn device_query<T: DeserializeOwned>(
        &self,
        query: Query,
        device: &DeviceId,
    ) -> Result<T, TelemetryError> {
        self.query(query, Some(device.as_str())).await
    }
}

#[async_trait]
impl TelemetrySource for ProbeTelemetrySource {
    async fn list_devices(&self, tier: Tier) -> Result<Vec<DeviceId>, TelemetryError> {
        let tier = tier.to_string();
        self.query(Query::ListDevices, Some(tier.as_str())).await
    }

    async fn dedup_mappings(&self) -> Result<Vec<DiskGroupMapping>, TelemetryError> {
        self.query(Query::DedupMappings, None).await
    }

    async fn latency_stats(&self, device: &DeviceId) -> Result<LatencyStats, TelemetryError> {
        self.device_query(Query::LatencyStats, device).await
    }

    async fn congestion_score(&self, device: &DeviceId) -> Result<u32, TelemetryError> {
        let score = self.device_query(Query::CongestionScore, device).await?;
        check_congestion(Query::CongestionScore, score)
    }

    async fn health(&self, device: &DeviceId) -> Result<DeviceHealth, TelemetryError> {
        self.device_query(Query::Health, device).await
    }

    async fn device_state(&self, device: &DeviceId) -> Result<DeviceState, TelemetryError> {
        self.device_query(Query::DeviceState, device).await
    }

    async fn smart_counters(&self, device: &DeviceId) -> Result<SmartCounters, TelemetryError> {
        self.device_query(Query::SmartCounters, device).await
    }

    async fn log_positions(&self, device: &DeviceId) -> Result<LogPositions, TelemetryError> {
        let positions: LogPositions = self.device_query(Query::LogPositions, device).await?;
        check_congestion(Query::LogPositions, positions.congestion)?;
        Ok(positions)
    }

    async fn prepare_latency(&self, device: &DeviceId) -> Result<PrepareLatency, TelemetryError> {
        self.device_query(Query::PrepareLatency, device).await
    }

    async fn dedup_stats(&self, device: &DeviceId) -> Result<DedupStats, TelemetryError> {
        let stats: DedupStats = self.device_query(Query::DedupStats, device).await?;
        if stats.used_bytes > stats.total_bytes {
            return Err(TelemetryError::Invariant {
                query: Query::DedupStats.as_str(),
                detail: format!(
                    "used {} bytes exceeds total {} bytes",
                    stats.used_bytes, stats.total_bytes
                ),
            });
        }
        Ok(stats)
    }

    async fn reclaim_complete(&self, device: &DeviceId) -> Result<bool, TelemetryError> {
        self.device_query(Query::ReclaimComplete, device).await
    }

    async fn host_is_virtual_machine(&self) -> Result<bool, TelemetryError> {
        self.query(Query::HostIsVirtualMachine, None).await
    }

    async fn config(&self) -> Result<MonitorConfig, TelemetryError> {
        self.query(Query::Config, None).await
    }
}
