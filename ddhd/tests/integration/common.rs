use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub use ddh_common::testing::init_test_logging;

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

/// Scratch directory holding a probe script and a daemon config.
pub struct DaemonFixture {
    dir: tempfile::TempDir,
}

impl DaemonFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an executable probe script and return its path.
    pub fn probe(&self, script: &str) -> PathBuf {
        let path = self.dir.path().join("ddh-probe");
        std::fs::write(&path, script).expect("write probe");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod probe");
        path
    }

    pub fn config(&self, contents: &str) -> PathBuf {
        let path = self.dir.path().join("ddhd.toml");
        std::fs::write(&path, contents).expect("write config");
        path
    }
}

/// Run the daemon binary with a clean environment for its own variables.
pub fn ddhd(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ddhd"))
        .args(args)
        .env_remove("DDH_CONFIG")
        .env_remove("DDH_LOG_LEVEL")
        .env_remove("DDH_LOG_FILE")
        .env_remove("DDH_LOG_ROTATE")
        .env_remove("DDH_LOG_JSON")
        .env_remove("DDH_PROBE")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run ddhd")
}
