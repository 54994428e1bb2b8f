//! Device telemetry sources for Disk Device Health.
//!
//! The monitor reads all device and host state through [`TelemetrySource`].
//! Two implementations ship with the crate: [`ProbeTelemetrySource`], which
//! runs an external probe program and strictly decodes its versioned JSON
//! output, and [`mock::MockTelemetry`] for tests.

pub mod error;
pub mod mock;
pub mod probe;
pub mod schema;
pub mod source;

pub use ddh_common::DeviceId;
pub use error::TelemetryError;
pub use probe::ProbeTelemetrySource;
pub use source::{Query, TelemetrySource};
