//! Edge-triggered responder.
//!
//! Mirrors the input line onto the output line with minimal latency: a rising
//! edge asserts the output, the following falling edge deasserts it. The loop
//! has exactly one suspension point, the edge wait, and checks the stop flag
//! every time that wait returns.

use rtt_common::{EdgeDetection, EdgeMode, ResponderConfig, ResponderState, RttError, RttResult, StateMachine};
use rtt_gpio::{Edge, EdgeSource, EdgeWait, LineHandle, LineRequestConfig, LineSettings};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Line request for the responder: input first, output second.
///
/// Polling does not need kernel edge events, so the input is requested
/// without edge detection in that mode. `active_low` inverts the input only;
/// the reply is always driven active-high.
#[must_use]
pub fn responder_request(config: &ResponderConfig, consumer: &str) -> LineRequestConfig {
    let edge = match config.detection {
        EdgeDetection::Blocking => EdgeMode::Both,
        EdgeDetection::Polling => EdgeMode::None,
    };
    LineRequestConfig::new(consumer)
        .line(
            LineSettings::input(config.input.get())
                .with_edge(edge)
                .with_bias(config.input_bias)
                .with_active_low(config.active_low),
        )
        .line(LineSettings::output(config.output.get(), false))
}

/// Edge and wait counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponderCounters {
    /// Rising edges that asserted the output.
    pub rising: u64,
    /// Falling edges, paired or not.
    pub falling: u64,
    /// Waits that ended without an edge.
    pub timeouts: u64,
    /// Edges that arrived in the wrong state.
    pub spurious: u64,
    /// Waits cut short by a signal.
    pub interrupted: u64,
}

/// Result of one responder iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An edge was handled.
    Edge(Edge),
    /// The wait timed out.
    Timeout,
    /// The wait was interrupted.
    Interrupted,
    /// The responder has shut down.
    Stopped,
}

/// Edge-triggered responder over one input and one output line.
pub struct Responder<E: EdgeSource> {
    lines: Box<dyn LineHandle>,
    source: E,
    input: u32,
    output: u32,
    wait_timeout: Option<Duration>,
    machine: StateMachine,
    counters: ResponderCounters,
}

impl<E: EdgeSource> std::fmt::Debug for Responder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("source", &self.source.name())
            .field("input", &self.input)
            .field("output", &self.output)
            .field("state", &self.machine.state())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl<E: EdgeSource> Responder<E> {
    /// Build a responder over an existing request.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if the request does not hold both lines.
    pub fn new(
        lines: Box<dyn LineHandle>,
        source: E,
        input: u32,
        output: u32,
        wait_timeout: Option<Duration>,
    ) -> RttResult<Self> {
        for offset in [input, output] {
            if !lines.contains(offset) {
                return Err(RttError::ResourceUnavailable(format!(
                    "responder request does not hold line {offset}"
                )));
            }
        }
        Ok(Self {
            lines,
            source,
            input,
            output,
            wait_timeout,
            machine: StateMachine::new(),
            counters: ResponderCounters::default(),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ResponderState {
        self.machine.state()
    }

    /// Counters so far.
    #[must_use]
    pub fn counters(&self) -> ResponderCounters {
        self.counters
    }

    fn drive(&mut self, active: bool) -> RttResult<()> {
        self.lines.write(self.output, active)
    }

    /// Run one wait-and-react iteration.
    ///
    /// # Errors
    ///
    /// Any line failure; the caller must shut down.
    pub fn step(&mut self) -> RttResult<StepOutcome> {
        match self.machine.state() {
            ResponderState::ShuttingDown => return Ok(StepOutcome::Stopped),
            ResponderState::Idle => self.machine.transition(ResponderState::WaitingForEdge)?,
            ResponderState::WaitingForEdge | ResponderState::Reacting => {}
        }

        let wait = self
            .source
            .wait_edge(self.lines.as_mut(), self.input, self.wait_timeout)?;

        let state = self.machine.state();
        let outcome = match (state, wait) {
            (ResponderState::WaitingForEdge, EdgeWait::Event(ev)) if ev.edge == Edge::Rising => {
                self.drive(true)?;
                self.counters.rising += 1;
                self.machine.transition(ResponderState::Reacting)?;
                trace!(ts = ev.timestamp_ns, seqno = ev.seqno, "rising edge, output asserted");
                StepOutcome::Edge(Edge::Rising)
            }
            (ResponderState::WaitingForEdge, EdgeWait::Event(ev)) => {
                self.drive(false)?;
                self.counters.falling += 1;
                self.counters.spurious += 1;
                self.machine.transition(ResponderState::Idle)?;
                debug!(ts = ev.timestamp_ns, "falling edge while idle, output forced inactive");
                StepOutcome::Edge(Edge::Falling)
            }
            (ResponderState::Reacting, EdgeWait::Event(ev)) if ev.edge == Edge::Falling => {
                self.drive(false)?;
                self.counters.falling += 1;
                self.machine.transition(ResponderState::Idle)?;
                trace!(ts = ev.timestamp_ns, seqno = ev.seqno, "falling edge, output deasserted");
                StepOutcome::Edge(Edge::Falling)
            }
            (ResponderState::Reacting, EdgeWait::Event(ev)) => {
                // Missed falling edge; the output is already active.
                self.counters.spurious += 1;
                debug!(ts = ev.timestamp_ns, "rising edge while reacting");
                StepOutcome::Edge(Edge::Rising)
            }
            (_, EdgeWait::Timeout) => {
                self.counters.timeouts += 1;
                if state == ResponderState::WaitingForEdge {
                    self.machine.transition(ResponderState::Idle)?;
                }
                StepOutcome::Timeout
            }
            (_, EdgeWait::Interrupted) => {
                self.counters.interrupted += 1;
                if state == ResponderState::WaitingForEdge {
                    self.machine.transition(ResponderState::Idle)?;
                }
                StepOutcome::Interrupted
            }
            (ResponderState::Idle | ResponderState::ShuttingDown, EdgeWait::Event(_)) => {
                return Err(RttError::InvalidStateTransition {
                    from: state.to_string(),
                    to: ResponderState::Reacting.to_string(),
                })
            }
        };
        Ok(outcome)
    }

    /// Loop until `stop` is set, `max_edges` rising edges were handled, or a
    /// line fails. The output is deasserted on every exit path.
    ///
    /// # Errors
    ///
    /// The first line failure.
    pub fn run(&mut self, stop: &AtomicBool, max_edges: Option<u64>) -> RttResult<ResponderCounters> {
        info!(
            source = self.source.name(),
            input = self.input,
            output = self.output,
            "Responder loop started"
        );

        let result = loop {
            if stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if max_edges.is_some_and(|max| self.counters.rising >= max)
                && self.machine.state() != ResponderState::Reacting
            {
                break Ok(());
            }
            if let Err(e) = self.step() {
                error!(error = %e, state = %self.machine.state(), "Responder line failure");
                break Err(e);
            }
        };

        self.shutdown();
        info!(counters = ?self.counters, "Responder loop exited");
        result.map(|()| self.counters)
    }

    /// Deassert the output and enter the terminal state.
    pub fn shutdown(&mut self) {
        if self.machine.state().is_terminal() {
            return;
        }
        self.machine.enter_shutdown();
        if let Err(e) = self.drive(false) {
            warn!(error = %e, "failed to deassert output during shutdown");
        }
    }
}
