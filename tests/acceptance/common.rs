//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Wiring a simulated bench (stimulus, responder, capture)
//! - Building fake `/proc` trees
//! - A recording scheduler backend
//! - Checking hardware prerequisites

#![allow(dead_code)] // Not every test module uses every helper

use rtt_common::{LineOffset, MissedReplyPolicy, ResponderConfig, RttError, RttResult, SchedPolicy, StimulusConfig};
use rtt_gpio::{BlockingEdges, LineController, SimClock, SimulatedChip};
use rtt_runtime::{
    capture_request, check_rt_capabilities, responder_request, stimulus_output_request, CaptureHandler,
    CaptureState, Responder, SchedOps, StimulusNode,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Bench line assignment: stimulus out, responder in, responder out,
/// capture in.
pub const STIM_OUT: u32 = 0;
pub const RESP_IN: u32 = 1;
pub const RESP_OUT: u32 = 2;
pub const STIM_IN: u32 = 3;

/// Stimulus settings for the simulated bench.
pub fn stimulus_config(window: usize, skip: usize) -> StimulusConfig {
    StimulusConfig {
        output: LineOffset(STIM_OUT),
        input: LineOffset(STIM_IN),
        period: Duration::from_millis(1),
        pulse_width: Duration::ZERO,
        window_size: window,
        skip,
        capture_timeout: Duration::from_millis(1),
        missed_reply: MissedReplyPolicy::Reject,
        ..StimulusConfig::default()
    }
}

/// Responder settings for the simulated bench.
pub fn responder_config() -> ResponderConfig {
    ResponderConfig {
        input: LineOffset(RESP_IN),
        output: LineOffset(RESP_OUT),
        ..ResponderConfig::default()
    }
}

/// Virtual-time chip with the stimulus reaching the responder after
/// `propagation` and the responder driving its reply `response` later.
pub fn wired_chip(propagation: Duration, response: Duration) -> SimulatedChip {
    let chip = SimulatedChip::new("bench", 4);
    chip.connect(STIM_OUT, RESP_IN, propagation).unwrap();
    chip.connect(RESP_OUT, STIM_IN, Duration::ZERO).unwrap();
    chip.set_write_latency(RESP_OUT, response).unwrap();
    chip
}

/// All three parties of one bench, stepped by hand.
pub struct Bench {
    pub chip: SimulatedChip,
    pub node: StimulusNode<SimClock>,
    pub responder: Responder<BlockingEdges>,
    pub capture: CaptureHandler,
    pub state: Arc<CaptureState>,
}

impl Bench {
    pub fn new(chip: SimulatedChip, stimulus: &StimulusConfig) -> Self {
        let responder_cfg = responder_config();
        let resp_lines = chip.request(&responder_request(&responder_cfg, "responder")).unwrap();
        let responder = Responder::new(
            resp_lines,
            BlockingEdges::new(),
            RESP_IN,
            RESP_OUT,
            Some(Duration::from_millis(1)),
        )
        .unwrap();

        let state = Arc::new(CaptureState::from_config(stimulus));
        let out = chip.request(&stimulus_output_request(stimulus, "stimulus")).unwrap();
        let input = chip.request(&capture_request(stimulus, "stimulus")).unwrap();
        let node = StimulusNode::new(out, chip.clock(), stimulus, Arc::clone(&state)).unwrap();
        let capture = CaptureHandler::new(input, STIM_IN, Arc::clone(&state)).unwrap();

        Self {
            chip,
            node,
            responder,
            capture,
            state,
        }
    }

    /// Emit one pulse, let the responder mirror it, and capture the reply.
    ///
    /// Returns the window report that the pulse's cycle produced, if any.
    pub fn round(&mut self, period: Duration) -> Option<rtt_runtime::WindowReport> {
        let report = self.node.cycle().unwrap();
        // Rising edge, then the falling edge of the zero-width pulse
        self.responder.step().unwrap();
        self.responder.step().unwrap();
        self.capture.step(Some(Duration::from_millis(1))).unwrap();
        self.chip.advance(period).unwrap();
        report
    }
}

/// Write one task (and its process `comm` when `pid == tid`) under `root`.
pub fn write_task(root: &Path, pid: i32, tid: i32, comm: &str) {
    let dir = root.join(pid.to_string()).join("task").join(tid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
    if pid == tid {
        fs::write(root.join(pid.to_string()).join("comm"), format!("{comm}\n")).unwrap();
    }
}

/// A `/proc` with two threaded handlers for IRQ 45 and a decoy for IRQ 145.
pub fn fake_proc() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_task(dir.path(), 1, 1, "systemd");
    write_task(dir.path(), 88, 88, "irq/45-gpio-edge");
    write_task(dir.path(), 90, 90, "irq/145-spi0");
    write_task(dir.path(), 120, 120, "kworker/0:1");
    write_task(dir.path(), 120, 121, "irq/45-gpio-edge-s");
    dir
}

/// Scheduler backend that keeps per-thread state in memory and records
/// every change request.
#[derive(Debug, Default)]
pub struct RecordingSched {
    pub state: RefCell<HashMap<i32, (SchedPolicy, u8)>>,
    pub sets: RefCell<Vec<(i32, SchedPolicy, u8)>>,
}

impl SchedOps for RecordingSched {
    fn get(&self, tid: i32) -> RttResult<(SchedPolicy, u8)> {
        Ok(self
            .state
            .borrow()
            .get(&tid)
            .copied()
            .unwrap_or((SchedPolicy::Other, 0)))
    }

    fn set(&self, tid: i32, policy: SchedPolicy, priority: u8) -> RttResult<()> {
        if tid < 0 {
            return Err(RttError::SchedulingDegradation(format!("no such thread {tid}")));
        }
        self.sets.borrow_mut().push((tid, policy, priority));
        self.state.borrow_mut().insert(tid, (policy, priority));
        Ok(())
    }
}

/// Check if running as root (required for RT priority and `/dev/gpiochip*`).
pub fn is_root() -> bool {
    check_rt_capabilities().is_root
}

/// Check whether a GPIO character device is present.
pub fn has_gpiochip(path: &str) -> bool {
    Path::new(path).exists()
}
