//! Stimulus/capture node.
//!
//! The main loop emits one pulse per period and records the emission time;
//! a capture thread blocked on the reply line's edge events timestamps the
//! reply and appends `t_capture - t_emit` to the sample window. Both
//! timestamps come from this node's monotonic clock, so the other node's
//! clock never enters a sample.
//!
//! The only state the two threads share is [`CaptureState`]. Its lock is held
//! for constant-time work only: a full window is swapped out for an empty one
//! and the statistics are computed after the lock is released.

use crate::pacing::{busy_wait, Pacer};
use rtt_common::{
    duration_ns, Clock, EdgeMode, LatencyStatistics, MissedReplyPolicy, RttError, RttResult, SampleWindow,
    ScaledStatistics, StimulusConfig,
};
use rtt_gpio::{Edge, EdgeWait, LineController, LineHandle, LineRequestConfig, LineSettings};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Reporting unit divisor: samples are nanoseconds, reports microseconds.
const NS_PER_US: f64 = 1_000.0;

/// How long the capture thread blocks before re-checking its stop flag.
const CAPTURE_POLL: Duration = Duration::from_millis(50);

/// What happened to one captured reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Appended as a round-trip sample (nanoseconds).
    Accepted(u64),
    /// Later than the capture timeout, or earlier than the emission.
    Stale,
    /// A second reply to the same emission.
    Duplicate,
    /// A reply before any emission.
    Unsolicited,
    /// The window was full; the sample was dropped.
    Dropped,
}

/// Per-window bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounters {
    /// Pulses emitted.
    pub emissions: u64,
    /// Replies appended to the window.
    pub accepted: u64,
    /// Replies rejected as stale.
    pub stale: u64,
    /// Replies rejected as duplicates.
    pub duplicate: u64,
    /// Replies with no emission to match.
    pub unsolicited: u64,
    /// Emissions that never received a reply.
    pub missed: u64,
    /// Replies dropped because the window was full.
    pub dropped: u64,
}

impl WindowCounters {
    /// Replies that were not appended.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.stale + self.duplicate + self.unsolicited + self.dropped
    }

    fn accumulate(&mut self, other: &WindowCounters) {
        self.emissions += other.emissions;
        self.accepted += other.accepted;
        self.stale += other.stale;
        self.duplicate += other.duplicate;
        self.unsolicited += other.unsolicited;
        self.missed += other.missed;
        self.dropped += other.dropped;
    }
}

#[derive(Debug)]
struct CaptureInner {
    samples: SampleWindow,
    periods: SampleWindow,
    t_emit: Option<u64>,
    replied: bool,
    last_capture: Option<u64>,
    counters: WindowCounters,
}

/// State shared between the emitting loop and the capture handler.
#[derive(Debug)]
pub struct CaptureState {
    inner: Mutex<CaptureInner>,
    policy: MissedReplyPolicy,
    timeout_ns: u64,
    track_periods: bool,
}

impl CaptureState {
    /// State for windows of `window_size` samples.
    #[must_use]
    pub fn new(window_size: usize, policy: MissedReplyPolicy, capture_timeout: Duration, track_periods: bool) -> Self {
        Self {
            inner: Mutex::new(CaptureInner {
                samples: SampleWindow::new(window_size),
                periods: SampleWindow::new(window_size),
                t_emit: None,
                replied: false,
                last_capture: None,
                counters: WindowCounters::default(),
            }),
            policy,
            timeout_ns: duration_ns(capture_timeout),
            track_periods,
        }
    }

    /// State configured from the `[stimulus]` section.
    #[must_use]
    pub fn from_config(config: &StimulusConfig) -> Self {
        Self::new(
            config.window_size,
            config.missed_reply,
            config.capture_timeout,
            config.period_stats,
        )
    }

    fn lock(&self) -> RttResult<MutexGuard<'_, CaptureInner>> {
        self.inner
            .lock()
            .map_err(|_| RttError::Io("capture state poisoned".into()))
    }

    /// Record a pulse emission at `t_emit`.
    ///
    /// # Errors
    ///
    /// `Io` if the state is poisoned.
    pub fn begin_emission(&self, t_emit: u64) -> RttResult<()> {
        let mut inner = self.lock()?;
        if self.policy == MissedReplyPolicy::Reject && inner.t_emit.is_some() && !inner.replied {
            inner.counters.missed += 1;
        }
        inner.t_emit = Some(t_emit);
        inner.replied = false;
        inner.counters.emissions += 1;
        Ok(())
    }

    /// Classify and record a reply captured at `t_capture`.
    ///
    /// # Errors
    ///
    /// `Io` if the state is poisoned.
    pub fn on_capture(&self, t_capture: u64) -> RttResult<CaptureOutcome> {
        let mut inner = self.lock()?;
        let inner = &mut *inner;

        let Some(t_emit) = inner.t_emit else {
            inner.counters.unsolicited += 1;
            return Ok(CaptureOutcome::Unsolicited);
        };
        let Some(sample) = t_capture.checked_sub(t_emit) else {
            inner.counters.stale += 1;
            return Ok(CaptureOutcome::Stale);
        };

        if self.policy == MissedReplyPolicy::Reject {
            if inner.replied {
                inner.counters.duplicate += 1;
                return Ok(CaptureOutcome::Duplicate);
            }
            if sample > self.timeout_ns {
                inner.counters.stale += 1;
                return Ok(CaptureOutcome::Stale);
            }
        }

        inner.replied = true;
        if !inner.samples.append(sample) {
            inner.counters.dropped += 1;
            return Ok(CaptureOutcome::Dropped);
        }
        inner.counters.accepted += 1;

        if self.track_periods {
            if let Some(prev) = inner.last_capture {
                // A full period window just stops growing until the swap
                let _ = inner.periods.append(t_capture.saturating_sub(prev));
            }
        }
        inner.last_capture = Some(t_capture);
        Ok(CaptureOutcome::Accepted(sample))
    }

    /// Fill index of the live window.
    ///
    /// # Errors
    ///
    /// `Io` if the state is poisoned.
    pub fn fill(&self) -> RttResult<usize> {
        Ok(self.lock()?.samples.len())
    }

    /// If the live window is full, swap it (and the period window) with the
    /// caller's empty spares and take the counters.
    ///
    /// # Errors
    ///
    /// `Io` if the state is poisoned.
    pub fn swap_if_full(
        &self,
        samples: &mut SampleWindow,
        periods: &mut SampleWindow,
    ) -> RttResult<Option<WindowCounters>> {
        let mut inner = self.lock()?;
        if !inner.samples.is_full() {
            return Ok(None);
        }
        std::mem::swap(&mut inner.samples, samples);
        std::mem::swap(&mut inner.periods, periods);
        Ok(Some(std::mem::take(&mut inner.counters)))
    }
}

/// Statistics for one completed window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    /// Window number, from 1.
    pub window: u64,
    /// Round-trip statistics in nanoseconds.
    pub latency_ns: LatencyStatistics,
    /// Round-trip statistics in microseconds.
    pub latency_us: ScaledStatistics,
    /// Reply-to-reply interval statistics in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_us: Option<ScaledStatistics>,
    /// Bookkeeping since the previous report.
    pub counters: WindowCounters,
}

impl fmt::Display for WindowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}    MIN: {:.2} us    MAX: {:.2} us",
            self.latency_us, self.latency_us.min, self.latency_us.max
        )?;
        if let Some(period) = &self.period_us {
            write!(f, "    PERIOD: {:.2} us (RMS {:.2})", period.mean, period.rms)?;
        }
        let c = &self.counters;
        if c.missed > 0 || c.rejected() > 0 {
            write!(f, "    missed: {} rejected: {}", c.missed, c.rejected())?;
        }
        Ok(())
    }
}

/// Totals for a stimulus run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StimulusSummary {
    /// Windows reported.
    pub windows: u64,
    /// Pulses emitted.
    pub cycles: u64,
    /// Cycles that missed their deadline.
    pub overruns: u64,
    /// Counters over the whole run, excluding the unfinished window.
    pub totals: WindowCounters,
}

/// Stimulus line request: output only.
#[must_use]
pub fn stimulus_output_request(config: &StimulusConfig, consumer: &str) -> LineRequestConfig {
    LineRequestConfig::new(consumer).line(LineSettings::output(config.output.get(), false))
}

/// Capture line request: rising-edge input only.
#[must_use]
pub fn capture_request(config: &StimulusConfig, consumer: &str) -> LineRequestConfig {
    LineRequestConfig::new(consumer).line(
        LineSettings::input(config.input.get())
            .with_edge(EdgeMode::Rising)
            .with_bias(config.input_bias),
    )
}

/// Emitting side of the node.
pub struct StimulusNode<C: Clock> {
    lines: Box<dyn LineHandle>,
    output: u32,
    clock: C,
    period: Duration,
    pulse_width: Duration,
    skip: usize,
    state: Arc<CaptureState>,
    spare_samples: SampleWindow,
    spare_periods: SampleWindow,
    summary: StimulusSummary,
}

impl<C: Clock> fmt::Debug for StimulusNode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StimulusNode")
            .field("output", &self.output)
            .field("period", &self.period)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> StimulusNode<C> {
    /// Build the emitting side over an output request.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if the request does not hold the output line.
    pub fn new(
        lines: Box<dyn LineHandle>,
        clock: C,
        config: &StimulusConfig,
        state: Arc<CaptureState>,
    ) -> RttResult<Self> {
        let output = config.output.get();
        if !lines.contains(output) {
            return Err(RttError::ResourceUnavailable(format!(
                "stimulus request does not hold line {output}"
            )));
        }
        Ok(Self {
            lines,
            output,
            clock,
            period: config.period,
            pulse_width: config.pulse_width,
            skip: config.skip,
            state,
            spare_samples: SampleWindow::new(config.window_size),
            spare_periods: SampleWindow::new(config.window_size),
            summary: StimulusSummary::default(),
        })
    }

    /// Shared capture state.
    #[must_use]
    pub fn state(&self) -> &Arc<CaptureState> {
        &self.state
    }

    /// Totals so far.
    #[must_use]
    pub fn summary(&self) -> StimulusSummary {
        self.summary
    }

    /// Report and reset the window if it is full.
    ///
    /// # Errors
    ///
    /// `Config` if `skip` leaves no samples, `Io` if the state is poisoned.
    pub fn take_report(&mut self) -> RttResult<Option<WindowReport>> {
        let Some(counters) = self
            .state
            .swap_if_full(&mut self.spare_samples, &mut self.spare_periods)?
        else {
            return Ok(None);
        };

        let latency = self.spare_samples.drain(self.skip);
        let period = if self.spare_periods.len() > self.skip {
            Some(self.spare_periods.drain(self.skip)?.scaled(NS_PER_US))
        } else {
            self.spare_periods.reset();
            None
        };
        let latency = latency?;

        self.summary.windows += 1;
        self.summary.totals.accumulate(&counters);

        Ok(Some(WindowReport {
            window: self.summary.windows,
            latency_ns: latency,
            latency_us: latency.scaled(NS_PER_US),
            period_us: period,
            counters,
        }))
    }

    /// One cycle: report a full window, then emit a pulse.
    ///
    /// # Errors
    ///
    /// Line failures and the errors of [`StimulusNode::take_report`].
    pub fn cycle(&mut self) -> RttResult<Option<WindowReport>> {
        let report = self.take_report()?;

        let t_emit = self.clock.now_ns();
        self.state.begin_emission(t_emit)?;
        self.lines.write(self.output, true)?;
        busy_wait(self.pulse_width);
        self.lines.write(self.output, false)?;

        self.summary.cycles += 1;
        trace!(cycle = self.summary.cycles, t_emit, "pulse emitted");
        Ok(report)
    }

    /// Emit pulses every period until `stop` or `halt` is set or
    /// `max_windows` windows were reported.
    ///
    /// # Errors
    ///
    /// The first failure of [`StimulusNode::cycle`]. The output is
    /// deasserted on every exit path.
    pub fn run(
        &mut self,
        stop: &AtomicBool,
        halt: &AtomicBool,
        max_windows: Option<u64>,
        on_report: &mut dyn FnMut(&WindowReport),
    ) -> RttResult<StimulusSummary> {
        info!(
            output = self.output,
            period_us = self.period.as_micros(),
            pulse_ns = self.pulse_width.as_nanos(),
            "Stimulus loop started"
        );

        let mut pacer = Pacer::new(self.period);
        let result = loop {
            if stop.load(Ordering::Acquire) || halt.load(Ordering::Acquire) {
                break Ok(());
            }
            if max_windows.is_some_and(|max| self.summary.windows >= max) {
                break Ok(());
            }
            match self.cycle() {
                Ok(Some(report)) => {
                    info!(
                        window = report.window,
                        mean_us = report.latency_us.mean,
                        rms_us = report.latency_us.rms,
                        missed = report.counters.missed,
                        rejected = report.counters.rejected(),
                        "window complete"
                    );
                    on_report(&report);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Stimulus cycle failed");
                    break Err(e);
                }
            }
            while !pacer.wait() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
        };

        if let Err(e) = self.lines.write(self.output, false) {
            warn!(error = %e, "failed to deassert stimulus output");
        }
        self.summary.overruns = pacer.overruns();
        info!(summary = ?self.summary, "Stimulus loop exited");
        result.map(|()| self.summary)
    }
}

/// Capturing side of the node.
pub struct CaptureHandler {
    lines: Box<dyn LineHandle>,
    input: u32,
    state: Arc<CaptureState>,
}

impl fmt::Debug for CaptureHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandler")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

impl CaptureHandler {
    /// Build the capturing side over an edge-detecting input request.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if the request does not hold the input line.
    pub fn new(lines: Box<dyn LineHandle>, input: u32, state: Arc<CaptureState>) -> RttResult<Self> {
        if !lines.contains(input) {
            return Err(RttError::ResourceUnavailable(format!(
                "capture request does not hold line {input}"
            )));
        }
        Ok(Self { lines, input, state })
    }

    /// Wait once for a reply edge and record it.
    ///
    /// # Errors
    ///
    /// Wait failures and poisoned state.
    pub fn step(&mut self, timeout: Option<Duration>) -> RttResult<Option<CaptureOutcome>> {
        match self.lines.wait_edge(timeout)? {
            EdgeWait::Event(ev) if ev.offset == self.input && ev.edge == Edge::Rising => {
                let outcome = self.state.on_capture(ev.timestamp_ns)?;
                match outcome {
                    CaptureOutcome::Accepted(sample) => trace!(sample_ns = sample, "reply captured"),
                    other => debug!(?other, ts = ev.timestamp_ns, "reply not sampled"),
                }
                Ok(Some(outcome))
            }
            EdgeWait::Event(_) | EdgeWait::Timeout | EdgeWait::Interrupted => Ok(None),
        }
    }

    /// Capture until `halt` is set. On failure `halt` is set so the emitting
    /// loop stops too.
    ///
    /// # Errors
    ///
    /// The first failure of [`CaptureHandler::step`].
    pub fn run(&mut self, halt: &AtomicBool) -> RttResult<()> {
        block_termination_signals();
        debug!(input = self.input, "Capture thread started");
        while !halt.load(Ordering::Acquire) {
            if let Err(e) = self.step(Some(CAPTURE_POLL)) {
                error!(error = %e, "Capture failed");
                halt.store(true, Ordering::Release);
                return Err(e);
            }
        }
        debug!("Capture thread exiting");
        Ok(())
    }
}

/// Keep SIGINT/SIGTERM on the main thread.
#[cfg(unix)]
fn block_termination_signals() {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    if let Err(e) = set.thread_block() {
        warn!(error = %e, "failed to block signals on capture thread");
    }
}

#[cfg(not(unix))]
fn block_termination_signals() {}

/// Request the stimulus and capture lines, run the capture thread and the
/// emitting loop until `stop` or `max_windows`, and release everything.
///
/// Emissions are stamped on the controller's own timestamp clock, so both
/// ends of every sample share one time base.
///
/// # Errors
///
/// Request failures, and the first failure of either thread.
pub fn run_stimulus(
    controller: &dyn LineController,
    consumer: &str,
    config: &StimulusConfig,
    stop: &AtomicBool,
    max_windows: Option<u64>,
    on_report: &mut dyn FnMut(&WindowReport),
) -> RttResult<StimulusSummary> {
    let output_lines = controller.request(&stimulus_output_request(config, consumer))?;
    let input_lines = controller.request(&capture_request(config, consumer))?;

    let state = Arc::new(CaptureState::from_config(config));
    let mut node = StimulusNode::new(output_lines, controller.timestamp_clock(), config, Arc::clone(&state))?;
    let mut capture = CaptureHandler::new(input_lines, config.input.get(), state)?;
    let halt = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|s| -> RttResult<StimulusSummary> {
        let capture_thread = s.spawn(|_| capture.run(&halt));
        let result = node.run(stop, &halt, max_windows, on_report);
        halt.store(true, Ordering::Release);
        let captured = capture_thread
            .join()
            .map_err(|_| RttError::Io("capture thread panicked".into()))?;
        let summary = result?;
        captured?;
        Ok(summary)
    })
    .map_err(|_| RttError::Io("stimulus scope panicked".into()))?
}
