use crate::common::{DaemonFixture, ddhd, init_test_logging};

const DISABLED_PROBE: &str = r#"#!/bin/sh
case "$1" in
  config)
    cat <<'JSON'
{"schema_version": 1, "data": {
  "pull_the_plug": true, "pull_the_plug_on_tier1": false,
  "remount_after_failed": true, "remount_window_secs": 86400,
  "latency_interval_count": 5, "latency_time_period_mins": 240,
  "log_congestion_diagnosis": true, "log_congestion_interval_count": 3,
  "prepare_latency_diagnosis": true, "prepare_latency_interval_count": 3,
  "poll_interval_secs": 300, "device_monitoring_enabled": false,
  "monitor_in_vm_enabled": false, "dedup_space_reclaim": "complete"}}
JSON
    ;;
  *)
    echo "unexpected query $1" >&2
    exit 64 ;;
esac
"#;

const BROKEN_PROBE: &str = r#"#!/bin/sh
echo 'store offline' >&2
exit 1
"#;

#[test]
fn test_once_with_monitoring_disabled_exits_cleanly() {
    init_test_logging();
    crate::test_log!("TEST START: test_once_with_monitoring_disabled_exits_cleanly");

    let fixture = DaemonFixture::new();
    let probe = fixture.probe(DISABLED_PROBE);
    let missing_config = fixture.path().join("absent.toml");

    let output = ddhd(&[
        "--once",
        "--config",
        missing_config.to_str().unwrap(),
        "--probe",
        probe.to_str().unwrap(),
        "--loglevel",
        "info",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "ddhd --once failed: {stderr}");
    assert!(stderr.contains("Device monitoring is disabled"), "got: {stderr}");
}

#[test]
fn test_once_fails_when_policy_is_unreadable() {
    init_test_logging();

    let fixture = DaemonFixture::new();
    let probe = fixture.probe(BROKEN_PROBE);
    let config = fixture.config(&format!(
        "[ddhd]\nprobe = {:?}\nprobe_timeout = \"5s\"\n",
        probe.to_str().unwrap()
    ));

    let output = ddhd(&["--once", "--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("reading monitor config"), "got: {stderr}");
}

#[test]
fn test_invalid_config_file_falls_back_to_defaults() {
    init_test_logging();

    let fixture = DaemonFixture::new();
    let probe = fixture.probe(DISABLED_PROBE);
    let config = fixture.config("[ddhd]\nprobe_timeout = \"whenever\"\n");

    let output = ddhd(&[
        "--once",
        "--config",
        config.to_str().unwrap(),
        "--probe",
        probe.to_str().unwrap(),
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "ddhd --once failed: {stderr}");
    assert!(stderr.contains("Ignoring daemon config"), "got: {stderr}");
}
