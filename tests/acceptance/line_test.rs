//! Exclusive line requests, bounded waits, and release on drop.

use super::common::{has_gpiochip, is_root};
use rtt_common::{Bias, EdgeMode, RttError};
use rtt_gpio::{CdevChip, EdgeWait, LineController, LineRequestConfig, LineSettings, SimulatedChip};
use std::time::Duration;

#[test]
fn test_non_overlapping_requests() {
    let chip = SimulatedChip::new("lines", 8);
    let mut a = chip
        .request(&LineRequestConfig::new("a").line(LineSettings::output(0, false)))
        .unwrap();
    let mut b = chip
        .request(&LineRequestConfig::new("b").line(LineSettings::input(1).with_edge(EdgeMode::Both)))
        .unwrap();

    assert!(matches!(a.read(1), Err(RttError::ResourceUnavailable(_))));
    assert!(matches!(b.write(0, true), Err(RttError::ResourceUnavailable(_))));
    assert!(matches!(a.write(5, true), Err(RttError::ResourceUnavailable(_))));
    a.write(0, true).unwrap();
    assert!(a.read(0).unwrap());
}

#[test]
fn test_claimed_input_is_unavailable() {
    let chip = SimulatedChip::new("lines", 8);
    let _responder = chip
        .request(
            &LineRequestConfig::new("responder")
                .line(LineSettings::input(4).with_edge(EdgeMode::Both))
                .line(LineSettings::output(5, true)),
        )
        .unwrap();

    let clash = chip.request(
        &LineRequestConfig::new("intruder")
            .line(LineSettings::output(6, true))
            .line(LineSettings::input(4)),
    );
    assert!(matches!(clash, Err(RttError::ResourceUnavailable(_))));

    // Nothing of the failed request was claimed or driven
    assert!(!chip.is_claimed(6));
    assert_eq!(chip.level(6), Some(false));
    // The existing request is untouched
    assert!(chip.is_claimed(4));
    assert_eq!(chip.level(5), Some(true));
}

#[test]
fn test_zero_timeout_returns_timeout() {
    let chip = SimulatedChip::new("lines", 2);
    let mut lines = chip
        .request(&LineRequestConfig::new("w").line(LineSettings::input(0).with_edge(EdgeMode::Rising)))
        .unwrap();
    assert_eq!(lines.wait_edge(Some(Duration::ZERO)).unwrap(), EdgeWait::Timeout);
}

#[test]
fn test_zero_timeout_on_realtime_chip() {
    let chip = SimulatedChip::realtime("lines-rt", 2);
    let mut lines = chip
        .request(&LineRequestConfig::new("w").line(LineSettings::input(0).with_edge(EdgeMode::Both)))
        .unwrap();
    let start = std::time::Instant::now();
    assert_eq!(lines.wait_edge(Some(Duration::ZERO)).unwrap(), EdgeWait::Timeout);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_drop_releases_lines() {
    let chip = SimulatedChip::new("lines", 4);
    let request = LineRequestConfig::new("once")
        .line(LineSettings::input(2).with_bias(Bias::PullUp))
        .line(LineSettings::output(3, false));
    let held = chip.request(&request).unwrap();
    assert!(chip.request(&request).is_err());
    drop(held);
    assert!(!chip.is_claimed(2));
    assert!(chip.request(&request).is_ok());
}

#[test]
fn test_missing_device_is_device_error() {
    let err = CdevChip::open("/dev/gpiochip-does-not-exist").unwrap_err();
    assert!(matches!(err, RttError::Device(_)));
}

/// Needs a chip with lines 0 (output) and 1 (input) jumpered together.
#[test]
#[ignore = "Requires root and /dev/gpiochip0 with line 0 jumpered to line 1"]
fn test_hardware_loopback_edge() {
    if !is_root() || !has_gpiochip("/dev/gpiochip0") {
        eprintln!("Skipping test: no accessible /dev/gpiochip0");
        return;
    }

    let chip = CdevChip::open("/dev/gpiochip0").expect("open chip");
    let mut out = chip
        .request(&LineRequestConfig::new("rtt-hw-out").line(LineSettings::output(0, false)))
        .expect("request output");
    let mut input = chip
        .request(&LineRequestConfig::new("rtt-hw-in").line(LineSettings::input(1).with_edge(EdgeMode::Rising)))
        .expect("request input");

    out.write(0, true).expect("drive high");
    match input.wait_edge(Some(Duration::from_millis(100))).expect("wait") {
        EdgeWait::Event(ev) => assert_eq!(ev.offset, 1),
        other => panic!("expected an edge, got {other:?}"),
    }
    out.write(0, false).expect("drive low");
}
