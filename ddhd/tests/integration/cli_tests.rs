use crate::common::{ddhd, init_test_logging};

#[test]
fn test_ddhd_help_includes_usage() {
    init_test_logging();
    crate::test_log!("TEST START: test_ddhd_help_includes_usage");

    let output = ddhd(&["--help"]);
    assert!(output.status.success(), "ddhd --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage"), "Expected usage, got: {stdout}");
    for flag in ["--config", "--loglevel", "--logfile", "--logrotate", "--probe", "--once"] {
        assert!(stdout.contains(flag), "Expected {flag} in help, got: {stdout}");
    }
    assert!(!stdout.contains("--seed"), "--seed should stay hidden");

    crate::test_log!("TEST PASS: test_ddhd_help_includes_usage");
}

#[test]
fn test_ddhd_version_reports_package_version() {
    init_test_logging();

    let output = ddhd(&["--version"]);
    assert!(output.status.success(), "ddhd --version failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "Expected version in output, got: {stdout}"
    );
}

#[test]
fn test_ddhd_rejects_unknown_flag() {
    init_test_logging();

    let output = ddhd(&["--no-such-flag"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--no-such-flag"), "got: {stderr}");
}
