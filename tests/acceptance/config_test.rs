//! Configuration files and machine-readable reports.

use super::common::{stimulus_config, wired_chip, Bench};
use rtt_common::{ConfigError, EdgeDetection, HarnessConfig, LineOffset, MissedReplyPolicy};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const BENCH_TOML: &str = r#"
[chip]
path = "/dev/gpiochip4"
consumer = "bench-a"

[responder]
input = { bank = 4, pin = 15 }
output = { bank = 4, pin = 12 }
detection = "blocking"
wait_timeout = "250ms"

[stimulus]
output = 144
input = 139
period = "5ms"
pulse_width = "2us"
window_size = 52
skip = 2
capture_timeout = "1ms"
missed_reply = "reject"

[realtime]
policy = "fifo"
priority = 95
irq_threads = [45]
cpu_affinity = 1
"#;

#[test]
fn test_load_bench_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(BENCH_TOML.as_bytes()).unwrap();

    let config = HarnessConfig::from_file(file.path()).unwrap();
    assert_eq!(config.chip.consumer, "bench-a");
    assert_eq!(config.responder.input, LineOffset(143));
    assert_eq!(config.responder.output, LineOffset(140));
    assert_eq!(config.responder.detection, EdgeDetection::Blocking);
    assert_eq!(config.responder.wait_timeout, Some(Duration::from_millis(250)));
    assert_eq!(config.stimulus.period, Duration::from_millis(5));
    assert_eq!(config.stimulus.pulse_width, Duration::from_micros(2));
    assert_eq!(config.stimulus.missed_reply, MissedReplyPolicy::Reject);
    assert_eq!(config.realtime.irq_threads, vec![45]);
}

#[test]
fn test_toml_round_trip() {
    let config = HarnessConfig::from_toml(BENCH_TOML).unwrap();
    let written = config.to_toml().unwrap();
    let reread = HarnessConfig::from_toml(&written).unwrap();
    assert_eq!(reread.to_toml().unwrap(), written);
    assert_eq!(reread.stimulus.window_size, 52);
    assert_eq!(reread.realtime.cpu_affinity, config.realtime.cpu_affinity);
}

#[test]
fn test_default_round_trip() {
    let written = HarnessConfig::default().to_toml().unwrap();
    let reread = HarnessConfig::from_toml(&written).unwrap();
    assert_eq!(reread.stimulus.skip, 2);
    assert_eq!(reread.responder.wait_timeout, Some(Duration::from_millis(100)));
}

#[test]
fn test_shipped_default_matches_builtin() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let shipped = HarnessConfig::from_file(&path).unwrap();
    assert_eq!(
        shipped.to_toml().unwrap(),
        HarnessConfig::default().to_toml().unwrap()
    );
}

#[test]
fn test_invalid_files_are_rejected() {
    let skip_too_large = BENCH_TOML.replace("skip = 2", "skip = 52");
    assert!(matches!(
        HarnessConfig::from_toml(&skip_too_large),
        Err(ConfigError::Invalid(_))
    ));

    let bad_priority = BENCH_TOML.replace("priority = 95", "priority = 0");
    assert!(matches!(
        HarnessConfig::from_toml(&bad_priority),
        Err(ConfigError::Invalid(_))
    ));

    let bad_duration = BENCH_TOML.replace("\"5ms\"", "\"soon\"");
    assert!(matches!(
        HarnessConfig::from_toml(&bad_duration),
        Err(ConfigError::Parse(_))
    ));

    let missing = HarnessConfig::from_file(std::path::Path::new("/nonexistent/gpio-rtt.toml"));
    assert!(matches!(missing, Err(ConfigError::Io { .. })));
}

#[test]
fn test_window_report_json() {
    let stimulus = stimulus_config(3, 1);
    let mut bench = Bench::new(wired_chip(Duration::from_micros(5), Duration::from_micros(15)), &stimulus);
    for _ in 0..3 {
        bench.round(Duration::from_millis(1));
    }
    let report = bench.node.cycle().unwrap().expect("window should be full");

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["window"], 1);
    assert_eq!(value["latency_ns"]["count"], 2);
    assert_eq!(value["latency_ns"]["min"], 20_000);
    assert_eq!(value["latency_us"]["mean"], 20.0);
    assert_eq!(value["counters"]["accepted"], 3);
    assert!(value["period_us"].is_object());

    let line = serde_json::to_string(&report).unwrap();
    assert!(!line.contains('\n'));
}
