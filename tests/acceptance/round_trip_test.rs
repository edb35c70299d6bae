//! Round-trip measurement through a simulated responder.
//!
//! A stimulus pulse reaches the responder after the propagation delay `P`,
//! the responder's reply appears `L` after it saw the edge, and the capture
//! side must record exactly `L + P` for every sample.

use super::common::{responder_config, stimulus_config, wired_chip, Bench, RESP_OUT, STIM_IN, STIM_OUT};
use rtt_common::MissedReplyPolicy;
use rtt_gpio::{BlockingEdges, LineController, SimulatedChip};
use rtt_runtime::{
    capture_request, responder_request, run_stimulus, stimulus_output_request, CaptureHandler, CaptureState,
    Responder, StimulusNode, WindowReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PROPAGATION: Duration = Duration::from_micros(5);
const PERIOD: Duration = Duration::from_millis(1);

#[test]
fn test_round_trip_is_response_plus_propagation() {
    for response_us in [0_u64, 3, 40, 250] {
        let response = Duration::from_micros(response_us);
        let stimulus = stimulus_config(6, 1);
        let mut bench = Bench::new(wired_chip(PROPAGATION, response), &stimulus);

        for _ in 0..6 {
            assert!(bench.round(PERIOD).is_none());
        }
        let report = bench.node.cycle().unwrap().expect("window should be full");

        let expected_ns = (PROPAGATION + response).as_nanos() as u64;
        assert_eq!(report.latency_ns.count, 5, "L = {response_us} us");
        assert_eq!(report.latency_ns.min, expected_ns, "L = {response_us} us");
        assert_eq!(report.latency_ns.max, expected_ns, "L = {response_us} us");
        assert!(report.latency_ns.rms.abs() < 1e-9);
        assert_eq!(report.counters.accepted, 6);
        assert_eq!(report.counters.missed, 0);
        assert_eq!(bench.responder.counters().rising, 6);
    }
}

#[test]
fn test_report_line_format() {
    let stimulus = stimulus_config(3, 1);
    let mut bench = Bench::new(wired_chip(PROPAGATION, Duration::from_micros(20)), &stimulus);
    for _ in 0..3 {
        bench.round(PERIOD);
    }
    let report = bench.node.cycle().unwrap().expect("window should be full");
    let line = report.to_string();
    assert!(line.starts_with("AVG: 25.00 us    RMS: 0.00 us"), "{line}");
    assert!(line.contains("MIN: 25.00 us    MAX: 25.00 us"), "{line}");
    assert!(!line.contains("missed"), "{line}");
}

#[test]
fn test_consecutive_windows_are_independent() {
    let stimulus = stimulus_config(4, 0);
    let chip = wired_chip(PROPAGATION, Duration::from_micros(10));
    let mut bench = Bench::new(chip, &stimulus);

    let mut reports: Vec<WindowReport> = Vec::new();
    for _ in 0..13 {
        if let Some(report) = bench.round(PERIOD) {
            reports.push(report);
        }
    }
    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert_eq!(report.window, i as u64 + 1);
        assert_eq!(report.latency_ns.count, 4);
        assert_eq!(report.latency_ns.mean, 15_000.0);
    }
}

#[test]
fn test_silent_responder_yields_no_samples() {
    // Reply path wired, but the responder never runs
    let stimulus = stimulus_config(3, 0);
    let chip = SimulatedChip::new("bench", 4);
    chip.connect(RESP_OUT, STIM_IN, Duration::ZERO).unwrap();
    let _idle = chip.request(&responder_request(&responder_config(), "idle")).unwrap();

    let state = Arc::new(CaptureState::from_config(&stimulus));
    let out = chip.request(&stimulus_output_request(&stimulus, "stimulus")).unwrap();
    let input = chip.request(&capture_request(&stimulus, "stimulus")).unwrap();
    let mut node = StimulusNode::new(out, chip.clock(), &stimulus, Arc::clone(&state)).unwrap();
    let mut capture = CaptureHandler::new(input, STIM_IN, Arc::clone(&state)).unwrap();

    for _ in 0..4 {
        assert!(node.cycle().unwrap().is_none());
        assert_eq!(capture.step(Some(Duration::ZERO)).unwrap(), None);
        chip.advance(PERIOD).unwrap();
    }
    assert_eq!(state.fill().unwrap(), 0);
    assert_eq!(node.summary().cycles, 4);
}

/// Stimulus and responder on separate threads against a real-time
/// simulated chip, the way the daemon's `--simulated` mode runs them.
#[test]
fn test_threaded_bench_on_realtime_chip() {
    let mut stimulus = stimulus_config(5, 1);
    stimulus.period = Duration::from_millis(2);
    stimulus.capture_timeout = Duration::from_millis(1);
    stimulus.missed_reply = MissedReplyPolicy::Reject;

    let chip = SimulatedChip::realtime("bench-rt", 4);
    chip.connect(STIM_OUT, 1, Duration::from_micros(2)).unwrap();
    chip.connect(RESP_OUT, STIM_IN, Duration::ZERO).unwrap();

    let responder_cfg = responder_config();
    let resp_lines = chip.request(&responder_request(&responder_cfg, "responder")).unwrap();
    let mut responder = Responder::new(
        resp_lines,
        BlockingEdges::new(),
        responder_cfg.input.get(),
        responder_cfg.output.get(),
        Some(Duration::from_millis(20)),
    )
    .unwrap();

    let stop = AtomicBool::new(false);
    let peer_stop = AtomicBool::new(false);
    let mut reports = Vec::new();

    let summary = std::thread::scope(|s| {
        let peer = s.spawn(|| responder.run(&peer_stop, None));
        let summary = run_stimulus(
            &chip,
            "stimulus",
            &stimulus,
            &stop,
            Some(2),
            &mut |r: &WindowReport| reports.push(r.clone()),
        );
        peer_stop.store(true, Ordering::Release);
        chip.interrupt();
        let counters = peer.join().unwrap().unwrap();
        assert!(counters.rising >= 10);
        summary
    })
    .unwrap();

    assert_eq!(summary.windows, 2);
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.latency_ns.count, 4);
        assert!(report.latency_ns.min >= 2_000);
    }
    assert!(!chip.is_claimed(STIM_OUT));
    assert!(!chip.is_claimed(STIM_IN));
}
