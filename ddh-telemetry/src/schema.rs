//! Strict decoding of versioned probe responses.
//!
//! Every probe response is a JSON envelope:
//!
//! ```json
//! {"schema_version": 1, "data": { ... }}
//! ```
//!
//! The version is checked before the payload so an incompatible probe yields
//! [`TelemetryError::SchemaVersion`] rather than a confusing field error.
//! Unknown fields anywhere in the envelope or the records are rejected.

use crate::{Query, TelemetryError};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Envelope version understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Upper bound of congestion scores reported by the storage stack.
pub const MAX_CONGESTION_SCORE: u32 = 256;

#[derive(Deserialize)]
struct VersionHeader {
    schema_version: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope<T> {
    #[allow(dead_code)]
    schema_version: u32,
    data: T,
}

/// Decode a probe response for `query`.
pub fn decode<T: DeserializeOwned>(query: Query, raw: &[u8]) -> Result<T, TelemetryError> {
    let header: VersionHeader =
        serde_json::from_slice(raw).map_err(|source| TelemetryError::Decode {
            query: query.as_str(),
            source,
        })?;
    if header.schema_version != SCHEMA_VERSION {
        return Err(TelemetryError::SchemaVersion {
            query: query.as_str(),
            found: header.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    let envelope: Envelope<T> =
        serde_json::from_slice(raw).map_err(|source| TelemetryError::Decode {
            query: query.as_str(),
            source,
        })?;
    Ok(envelope.data)
}

/// Reject congestion values outside `0..=256`.
pub fn check_congestion(query: Query, value: u32) -> Result<u32, TelemetryError> {
    if value > MAX_CONGESTION_SCORE {
        return Err(TelemetryError::Invariant {
            query: query.as_str(),
            detail: format!("congestion {value} exceeds {MAX_CONGESTION_SCORE}"),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddh_common::{DeviceHealth, LatencyStats, MonitorConfig};

    #[test]
    fn decode_accepts_current_version() {
        let raw = br#"{"schema_version": 1, "data": {"mounted": true, "flags": 16}}"#;
        let health: DeviceHealth = decode(Query::Health, raw).unwrap();
        assert!(health.is_failed());
    }

    #[test]
    fn decode_rejects_other_versions_before_payload() {
        let raw = br#"{"schema_version": 2, "data": {"whatever": 1}}"#;
        let err = decode::<DeviceHealth>(Query::Health, raw).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::SchemaVersion {
                found: 2,
                expected: 1,
                ..
            }
        ));
    }

    #[test]
    fn decode_rejects_unknown_envelope_fields() {
        let raw = br#"{"schema_version": 1, "data": true, "extra": 0}"#;
        let err = decode::<bool>(Query::ReclaimComplete, raw).unwrap_err();
        assert!(matches!(err, TelemetryError::Decode { .. }));
    }

    #[test]
    fn decode_rejects_unknown_record_fields() {
        let raw = br#"{"schema_version": 1, "data": {"mounted": true, "flags": 0, "color": "red"}}"#;
        assert!(decode::<DeviceHealth>(Query::Health, raw).is_err());
    }

    #[test]
    fn decode_rejects_missing_record_fields() {
        let raw = br#"{"schema_version": 1, "data": {"read": {}}}"#;
        assert!(decode::<LatencyStats>(Query::LatencyStats, raw).is_err());
    }

    #[test]
    fn decode_reports_malformed_json() {
        let err = decode::<bool>(Query::HostIsVirtualMachine, b"not json").unwrap_err();
        assert!(err.to_string().contains("host_is_virtual_machine"));
    }

    #[test]
    fn decode_config_rejects_missing_policy_fields() {
        for raw in [
            &br#"{"schema_version": 1, "data": {}}"#[..],
            br#"{"schema_version": 1, "data": {"poll_interval_secs": 120}}"#,
        ] {
            let err = decode::<MonitorConfig>(Query::Config, raw).unwrap_err();
            assert!(matches!(err, TelemetryError::Decode { query: "config", .. }), "{err}");
        }
    }

    #[test]
    fn decode_config_accepts_complete_policy() {
        let config = MonitorConfig {
            poll_interval_secs: 120,
            ..MonitorConfig::default()
        };
        let raw = serde_json::to_vec(&serde_json::json!({
            "schema_version": 1,
            "data": config,
        }))
        .unwrap();
        assert_eq!(decode::<MonitorConfig>(Query::Config, &raw).unwrap(), config);
    }

    #[test]
    fn decode_health_requires_flags() {
        let raw = br#"{"schema_version": 1, "data": {"mounted": false}}"#;
        let err = decode::<DeviceHealth>(Query::Health, raw).unwrap_err();
        assert!(matches!(err, TelemetryError::Decode { .. }));
    }

    #[test]
    fn check_congestion_bounds_scores() {
        assert_eq!(check_congestion(Query::CongestionScore, 256).unwrap(), 256);
        assert!(check_congestion(Query::CongestionScore, 257).is_err());
    }
}
