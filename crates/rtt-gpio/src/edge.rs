//! Edge sources for the responder.
//!
//! [`BlockingEdges`] sleeps in the controller until an edge event arrives.
//! [`PollingEdges`] re-reads the level with a fixed delay between reads and
//! synthesises edges from level changes, for controllers or kernels where
//! edge interrupts are unavailable or too slow.

use crate::{Edge, EdgeEvent, EdgeWait, LineHandle};
use rtt_common::{Clock, MonotonicClock, RttResult};
use std::time::{Duration, Instant};
use tracing::trace;

/// Strategy for observing edges on one input line.
pub trait EdgeSource: Send {
    /// Short strategy name for logs.
    fn name(&self) -> &'static str;

    /// Wait for the next edge on `offset`.
    ///
    /// `None` waits indefinitely; a zero timeout checks once and returns.
    ///
    /// # Errors
    ///
    /// Propagates read and wait failures from the line handle.
    fn wait_edge(
        &mut self,
        lines: &mut dyn LineHandle,
        offset: u32,
        timeout: Option<Duration>,
    ) -> RttResult<EdgeWait>;
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Kernel edge events.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingEdges;

impl BlockingEdges {
    /// Create a blocking edge source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EdgeSource for BlockingEdges {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn wait_edge(
        &mut self,
        lines: &mut dyn LineHandle,
        offset: u32,
        timeout: Option<Duration>,
    ) -> RttResult<EdgeWait> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut wait = timeout;
        loop {
            match lines.wait_edge(wait)? {
                EdgeWait::Event(event) if event.offset != offset => {
                    trace!(offset = event.offset, "ignoring edge on another line");
                    wait = remaining(deadline);
                }
                outcome => return Ok(outcome),
            }
        }
    }
}

/// Level polling with a fixed inter-read delay.
///
/// The logical level is assumed inactive before the first read, so an input
/// already active at startup yields a rising edge on the first poll.
#[derive(Debug, Clone)]
pub struct PollingEdges<C: Clock = MonotonicClock> {
    interval: Duration,
    clock: C,
    last: bool,
    seqno: u32,
}

impl PollingEdges<MonotonicClock> {
    /// Poll every `interval`, timestamping with `CLOCK_MONOTONIC`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, MonotonicClock)
    }
}

impl<C: Clock> PollingEdges<C> {
    /// Poll every `interval`, timestamping with `clock`.
    #[must_use]
    pub fn with_clock(interval: Duration, clock: C) -> Self {
        Self {
            interval,
            clock,
            last: false,
            seqno: 0,
        }
    }

    /// Delay between reads.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<C: Clock> EdgeSource for PollingEdges<C> {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn wait_edge(
        &mut self,
        lines: &mut dyn LineHandle,
        offset: u32,
        timeout: Option<Duration>,
    ) -> RttResult<EdgeWait> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let level = lines.read(offset)?;
            if level != self.last {
                self.last = level;
                self.seqno = self.seqno.wrapping_add(1);
                return Ok(EdgeWait::Event(EdgeEvent {
                    offset,
                    edge: if level { Edge::Rising } else { Edge::Falling },
                    timestamp_ns: self.clock.now_ns(),
                    seqno: self.seqno,
                }));
            }

            let nap = match remaining(deadline) {
                Some(left) if left.is_zero() => return Ok(EdgeWait::Timeout),
                Some(left) => left.min(self.interval),
                None => self.interval,
            };
            std::thread::sleep(nap);
        }
    }
}
