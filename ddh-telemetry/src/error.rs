//! Telemetry error types.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`crate::TelemetrySource`].
///
/// Every variant is recoverable: the monitor skips the affected device for the
/// current cycle and keeps its accumulated state.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("no telemetry for {query}{}", device_suffix(.device))]
    Unavailable {
        query: &'static str,
        device: Option<String>,
    },

    #[error("failed to spawn probe {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe query {query} timed out after {timeout:?}")]
    Timeout {
        query: &'static str,
        timeout: Duration,
    },

    #[error("probe query {query} failed ({status}): {stderr}")]
    ProbeFailed {
        query: &'static str,
        status: String,
        stderr: String,
    },

    #[error("failed to decode {query} response: {source}")]
    Decode {
        query: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{query} response has schema version {found}, expected {expected}")]
    SchemaVersion {
        query: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("{query} response violates invariant: {detail}")]
    Invariant { query: &'static str, detail: String },
}

fn device_suffix(device: &Option<String>) -> String {
    match device {
        Some(device) => format!(" on device {device}"),
        None => String::new(),
    }
}

impl TelemetryError {
    pub fn unavailable(query: &'static str, device: Option<&crate::DeviceId>) -> Self {
        Self::Unavailable {
            query,
            device: device.map(|d| d.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_message_names_device() {
        let err = TelemetryError::unavailable("latency_stats", Some(&"naa.01".into()));
        assert_eq!(err.to_string(), "no telemetry for latency_stats on device naa.01");
        let err = TelemetryError::unavailable("config", None);
        assert_eq!(err.to_string(), "no telemetry for config");
    }
}
