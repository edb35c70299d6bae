//! Window statistics over the default window geometry (N = 102, skip = 2).

use rtt_common::{RttError, SampleWindow, StimulusConfig};

fn default_window() -> (SampleWindow, usize) {
    let config = StimulusConfig::default();
    (SampleWindow::new(config.window_size), config.skip)
}

/// Two warm-up samples far off the steady state; they must not leak into
/// the result.
fn warm_up(window: &mut SampleWindow) {
    assert!(window.append(90_000));
    assert!(window.append(3));
}

#[test]
fn test_equal_samples_have_zero_rms() {
    let (mut window, skip) = default_window();
    warm_up(&mut window);
    for _ in 0..100 {
        assert!(window.append(500));
    }
    assert!(window.is_full());

    let stats = window.compute(skip).unwrap();
    assert_eq!(stats.count, 100);
    assert_eq!(stats.mean, 500.0);
    assert_eq!(stats.rms, 0.0);
    assert_eq!((stats.min, stats.max), (500, 500));
}

#[test]
fn test_symmetric_spread() {
    let (mut window, skip) = default_window();
    warm_up(&mut window);
    for _ in 0..50 {
        window.append(480);
    }
    for _ in 0..50 {
        window.append(520);
    }

    let stats = window.compute(skip).unwrap();
    assert_eq!(stats.count, 100);
    assert!((stats.mean - 500.0).abs() < 1e-9);
    assert!((stats.rms - 20.0).abs() < 1e-9);
    assert_eq!(stats.spread(), 40);

    let us = stats.scaled(1_000.0);
    assert!((us.mean - 0.5).abs() < 1e-12);
    assert!((us.rms - 0.02).abs() < 1e-12);
}

#[test]
fn test_full_window_rejects_appends() {
    let (mut window, _) = default_window();
    for i in 0..102 {
        assert!(window.append(i));
    }
    assert!(!window.append(7));
    assert_eq!(window.len(), 102);
    assert_eq!(window.samples()[101], 101);
}

#[test]
fn test_reset_then_refill() {
    let (mut window, skip) = default_window();
    for _ in 0..102 {
        window.append(1_000);
    }
    let first = window.drain(skip).unwrap();
    assert_eq!(first.mean, 1_000.0);
    assert!(window.is_empty());

    for i in 0..102 {
        assert!(window.append(2_000 + i % 2), "append {i} after reset");
    }
    assert!(window.is_full());
    let second = window.drain(skip).unwrap();
    assert_eq!(second.count, 100);
    assert!((second.mean - 2_000.5).abs() < 1e-9);
    assert!((second.rms - 0.5).abs() < 1e-9);
}

#[test]
fn test_skip_covering_window_is_config_error() {
    let mut window = SampleWindow::new(4);
    window.append(1);
    window.append(2);
    assert!(matches!(window.compute(2), Err(RttError::Config(_))));
    assert!(window.compute(1).is_ok());

    // drain resets even on failure
    assert!(window.drain(5).is_err());
    assert!(window.is_empty());
}
