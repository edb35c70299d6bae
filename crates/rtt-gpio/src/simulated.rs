//! In-memory line controller.
//!
//! Lines carry a physical level derived from, in order: the driving output,
//! an external drive (test harness or a wire), and the bias. Wires copy the
//! physical level of one line onto another after a fixed propagation delay;
//! output writes may also be given a latency before they reach the pin.
//!
//! Time is either virtual ([`ManualClock`], advanced by waits that consume
//! scheduled changes) or real (`CLOCK_MONOTONIC`, changes become due as time
//! passes). Edge events carry the time the physical change took effect.

use crate::line::{not_requested, Direction, LineRequestConfig};
use crate::{Edge, EdgeEvent, EdgeWait, LineController, LineHandle};
use rtt_common::{duration_ns, Bias, Clock, EdgeMode, ManualClock, MonotonicClock, RttError, RttResult};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// Time base of a simulated chip.
#[derive(Debug, Clone)]
pub enum SimClock {
    /// Advanced only by waits and [`SimulatedChip::advance`].
    Virtual(ManualClock),
    /// Wall `CLOCK_MONOTONIC`.
    Real(MonotonicClock),
}

impl Clock for SimClock {
    fn now_ns(&self) -> u64 {
        match self {
            Self::Virtual(c) => c.now_ns(),
            Self::Real(c) => c.now_ns(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Output,
    External,
}

/// A physical change waiting for its due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    at_ns: u64,
    seq: u64,
    offset: u32,
    level: bool,
    source: Source,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    request: u64,
    direction: Direction,
    edge: EdgeMode,
    active_low: bool,
}

#[derive(Debug, Clone, Default)]
struct SimLine {
    output: Option<bool>,
    external: Option<bool>,
    bias: Bias,
    claim: Option<Claim>,
    write_latency_ns: u64,
}

impl SimLine {
    fn physical(&self) -> bool {
        self.output
            .or(self.external)
            .unwrap_or(matches!(self.bias, Bias::PullUp))
    }
}

#[derive(Debug, Clone, Copy)]
struct Wire {
    from: u32,
    to: u32,
    delay_ns: u64,
}

#[derive(Debug, Default)]
struct RequestQueue {
    events: VecDeque<EdgeEvent>,
    seqno: u32,
}

#[derive(Debug, Default)]
struct ChipState {
    lines: Vec<SimLine>,
    wires: Vec<Wire>,
    pending: BinaryHeap<Reverse<Scheduled>>,
    queues: HashMap<u64, RequestQueue>,
    next_request: u64,
    next_seq: u64,
    interrupts: u64,
}

impl ChipState {
    fn line(&self, offset: u32) -> RttResult<&SimLine> {
        self.lines
            .get(offset as usize)
            .ok_or_else(|| RttError::ResourceUnavailable(format!("line {offset} does not exist")))
    }

    fn schedule(&mut self, at_ns: u64, offset: u32, level: bool, source: Source) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Reverse(Scheduled {
            at_ns,
            seq,
            offset,
            level,
            source,
        }));
    }

    /// Mutate one line and propagate the resulting level change.
    fn apply(&mut self, offset: u32, at_ns: u64, mutate: impl FnOnce(&mut SimLine)) {
        let Some(line) = self.lines.get_mut(offset as usize) else {
            return;
        };
        let before = line.physical();
        mutate(line);
        let after = line.physical();
        if before != after {
            self.level_changed(offset, after, at_ns);
        }
    }

    fn level_changed(&mut self, offset: u32, level: bool, at_ns: u64) {
        trace!(offset, level, at_ns, "simulated level change");

        if let Some(claim) = self.lines[offset as usize].claim {
            if claim.direction == Direction::Input {
                let edge = if level ^ claim.active_low {
                    Edge::Rising
                } else {
                    Edge::Falling
                };
                let wanted = match edge {
                    Edge::Rising => claim.edge.rising(),
                    Edge::Falling => claim.edge.falling(),
                };
                if wanted {
                    if let Some(queue) = self.queues.get_mut(&claim.request) {
                        queue.seqno = queue.seqno.wrapping_add(1);
                        let seqno = queue.seqno;
                        queue.events.push_back(EdgeEvent {
                            offset,
                            edge,
                            timestamp_ns: at_ns,
                            seqno,
                        });
                    }
                }
            }
        }

        let fanout: Vec<Wire> = self.wires.iter().copied().filter(|w| w.from == offset).collect();
        for wire in fanout {
            if wire.delay_ns == 0 {
                self.apply(wire.to, at_ns, |l| l.external = Some(level));
            } else {
                self.schedule(at_ns + wire.delay_ns, wire.to, level, Source::External);
            }
        }
    }

    /// Apply every scheduled change due at or before `now_ns`.
    fn settle(&mut self, now_ns: u64) {
        while let Some(Reverse(next)) = self.pending.peek().copied() {
            if next.at_ns > now_ns {
                break;
            }
            self.pending.pop();
            match next.source {
                Source::External => self.apply(next.offset, next.at_ns, |l| l.external = Some(next.level)),
                Source::Output => self.apply(next.offset, next.at_ns, |l| {
                    if l.claim.is_some_and(|c| c.direction == Direction::Output) {
                        l.output = Some(next.level);
                    }
                }),
            }
        }
    }

    fn next_due(&self) -> Option<u64> {
        self.pending.peek().map(|Reverse(s)| s.at_ns)
    }
}

struct Shared {
    name: String,
    clock: SimClock,
    state: Mutex<ChipState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> RttResult<MutexGuard<'_, ChipState>> {
        self.state
            .lock()
            .map_err(|_| RttError::Io(format!("simulated chip {} state poisoned", self.name)))
    }
}

/// In-memory line controller.
///
/// Clones share the same lines.
#[derive(Clone)]
pub struct SimulatedChip {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SimulatedChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChip")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl SimulatedChip {
    /// Chip with `num_lines` lines on a virtual clock starting at zero.
    #[must_use]
    pub fn new(name: impl Into<String>, num_lines: u32) -> Self {
        Self::with_clock(name, num_lines, SimClock::Virtual(ManualClock::new(0)))
    }

    /// Chip with `num_lines` lines on the real monotonic clock.
    #[must_use]
    pub fn realtime(name: impl Into<String>, num_lines: u32) -> Self {
        Self::with_clock(name, num_lines, SimClock::Real(MonotonicClock))
    }

    /// Chip with an explicit time base.
    #[must_use]
    pub fn with_clock(name: impl Into<String>, num_lines: u32, clock: SimClock) -> Self {
        let state = ChipState {
            lines: vec![SimLine::default(); num_lines as usize],
            ..ChipState::default()
        };
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                clock,
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    /// The chip's time base.
    #[must_use]
    pub fn clock(&self) -> SimClock {
        self.shared.clock.clone()
    }

    /// Copy the level of `from` onto `to` after `delay`.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if either line does not exist.
    pub fn connect(&self, from: u32, to: u32, delay: Duration) -> RttResult<()> {
        let mut state = self.shared.lock()?;
        state.line(from)?;
        state.line(to)?;
        state.wires.push(Wire {
            from,
            to,
            delay_ns: duration_ns(delay),
        });
        let level = state.lines[from as usize].physical();
        let now = self.shared.clock.now_ns();
        state.apply(to, now, |l| l.external = Some(level));
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Delay between a write to `offset` and the pin changing.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if the line does not exist.
    pub fn set_write_latency(&self, offset: u32, latency: Duration) -> RttResult<()> {
        let mut state = self.shared.lock()?;
        state.line(offset)?;
        state.lines[offset as usize].write_latency_ns = duration_ns(latency);
        Ok(())
    }

    /// Drive a line from outside any request, as a test fixture would.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` if the line does not exist or is a claimed output.
    pub fn drive(&self, offset: u32, level: bool) -> RttResult<()> {
        let mut state = self.shared.lock()?;
        if state
            .line(offset)?
            .claim
            .is_some_and(|c| c.direction == Direction::Output)
        {
            return Err(RttError::ResourceUnavailable(format!(
                "line {offset} is driven by a request"
            )));
        }
        let now = self.shared.clock.now_ns();
        state.settle(now);
        state.apply(offset, now, |l| l.external = Some(level));
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Physical level of a line, if it exists.
    #[must_use]
    pub fn level(&self, offset: u32) -> Option<bool> {
        let mut state = self.shared.lock().ok()?;
        state.settle(self.shared.clock.now_ns());
        state.lines.get(offset as usize).map(SimLine::physical)
    }

    /// Whether a request currently holds the line.
    #[must_use]
    pub fn is_claimed(&self, offset: u32) -> bool {
        self.shared
            .lock()
            .ok()
            .and_then(|s| s.lines.get(offset as usize).map(|l| l.claim.is_some()))
            .unwrap_or(false)
    }

    /// Advance a virtual clock and apply changes that become due.
    ///
    /// No effect on a real-time chip.
    ///
    /// # Errors
    ///
    /// `Io` if the chip state is poisoned.
    pub fn advance(&self, delta: Duration) -> RttResult<()> {
        if let SimClock::Virtual(clock) = &self.shared.clock {
            clock.advance(delta);
            let mut state = self.shared.lock()?;
            state.settle(clock.now_ns());
            drop(state);
            self.shared.changed.notify_all();
        }
        Ok(())
    }

    /// Make every pending and future-started wait return `Interrupted` once.
    pub fn interrupt(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.interrupts += 1;
        }
        self.shared.changed.notify_all();
    }
}

impl LineController for SimulatedChip {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn timestamp_clock(&self) -> Box<dyn Clock> {
        Box::new(self.clock())
    }

    fn request(&self, config: &LineRequestConfig) -> RttResult<Box<dyn LineHandle>> {
        config.validate()?;

        let mut state = self.shared.lock()?;
        for settings in &config.lines {
            if let Some(claim) = state.line(settings.offset)?.claim {
                return Err(RttError::ResourceUnavailable(format!(
                    "line {} on {} is held by request {}",
                    settings.offset, self.shared.name, claim.request
                )));
            }
        }

        let id = state.next_request;
        state.next_request += 1;
        state.queues.insert(id, RequestQueue::default());

        let now = self.shared.clock.now_ns();
        state.settle(now);
        for settings in &config.lines {
            let claim = Claim {
                request: id,
                direction: settings.direction,
                edge: settings.edge,
                active_low: settings.active_low,
            };
            state.apply(settings.offset, now, |l| {
                if settings.bias != Bias::AsIs {
                    l.bias = settings.bias;
                }
                l.output = match settings.direction {
                    Direction::Output => Some(settings.initial ^ settings.active_low),
                    Direction::Input => None,
                };
            });
            state.lines[settings.offset as usize].claim = Some(claim);
        }
        let interrupts = state.interrupts;
        drop(state);
        self.shared.changed.notify_all();

        debug!(
            chip = %self.shared.name,
            consumer = %config.consumer,
            offsets = ?config.offsets(),
            "simulated lines requested"
        );

        Ok(Box::new(SimulatedLineHandle {
            shared: Arc::clone(&self.shared),
            id,
            consumer: config.consumer.clone(),
            offsets: config.offsets(),
            interrupts_seen: interrupts,
        }))
    }
}

/// Request held on a [`SimulatedChip`].
struct SimulatedLineHandle {
    shared: Arc<Shared>,
    id: u64,
    consumer: String,
    offsets: Vec<u32>,
    interrupts_seen: u64,
}

impl SimulatedLineHandle {
    fn claim<'a>(&self, state: &'a ChipState, offset: u32) -> RttResult<&'a Claim> {
        state
            .lines
            .get(offset as usize)
            .and_then(|l| l.claim.as_ref())
            .filter(|c| c.request == self.id)
            .ok_or_else(|| not_requested(offset))
    }

    fn pop_event(&self, state: &mut ChipState) -> Option<EdgeEvent> {
        state.queues.get_mut(&self.id).and_then(|q| q.events.pop_front())
    }
}

impl LineHandle for SimulatedLineHandle {
    fn consumer(&self) -> &str {
        &self.consumer
    }

    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn read(&mut self, offset: u32) -> RttResult<bool> {
        let mut state = self.shared.lock()?;
        state.settle(self.shared.clock.now_ns());
        let active_low = self.claim(&state, offset)?.active_low;
        Ok(state.lines[offset as usize].physical() ^ active_low)
    }

    fn write(&mut self, offset: u32, active: bool) -> RttResult<()> {
        let mut state = self.shared.lock()?;
        let claim = *self.claim(&state, offset)?;
        if claim.direction != Direction::Output {
            return Err(RttError::Io(format!("line {offset} is an input")));
        }

        let now = self.shared.clock.now_ns();
        state.settle(now);
        let level = active ^ claim.active_low;
        let latency = state.lines[offset as usize].write_latency_ns;
        if latency == 0 {
            state.apply(offset, now, |l| l.output = Some(level));
        } else {
            state.schedule(now + latency, offset, level, Source::Output);
        }
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn wait_edge(&mut self, timeout: Option<Duration>) -> RttResult<EdgeWait> {
        let shared = Arc::clone(&self.shared);
        let clock = &shared.clock;
        let start = clock.now_ns();
        let deadline = timeout.map(|t| start.saturating_add(duration_ns(t)));
        let mut state = shared.lock()?;

        loop {
            if state.interrupts != self.interrupts_seen {
                self.interrupts_seen = state.interrupts;
                return Ok(EdgeWait::Interrupted);
            }

            let now = clock.now_ns();
            state.settle(now);
            if let Some(event) = self.pop_event(&mut state) {
                drop(state);
                shared.changed.notify_all();
                return Ok(EdgeWait::Event(event));
            }

            let next = state.next_due();
            if deadline.is_some_and(|d| now >= d) {
                return Ok(EdgeWait::Timeout);
            }

            match clock {
                SimClock::Virtual(manual) => {
                    // Consume the next change if it falls inside the wait.
                    if let Some(at) = next.filter(|&at| deadline.map_or(true, |d| at <= d)) {
                        manual.advance_to(at);
                        continue;
                    }
                    let guard = match timeout {
                        Some(t) => {
                            let (guard, result) = shared
                                .changed
                                .wait_timeout(state, t)
                                .map_err(|_| RttError::Io("simulated chip state poisoned".into()))?;
                            if result.timed_out() {
                                if let Some(d) = deadline {
                                    manual.advance_to(d);
                                }
                            }
                            guard
                        }
                        None => shared
                            .changed
                            .wait(state)
                            .map_err(|_| RttError::Io("simulated chip state poisoned".into()))?,
                    };
                    state = guard;
                }
                SimClock::Real(_) => {
                    let until = match (next, deadline) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    state = match until {
                        Some(until) => {
                            let nap = Duration::from_nanos(until.saturating_sub(now));
                            shared
                                .changed
                                .wait_timeout(state, nap)
                                .map_err(|_| RttError::Io("simulated chip state poisoned".into()))?
                                .0
                        }
                        None => shared
                            .changed
                            .wait(state)
                            .map_err(|_| RttError::Io("simulated chip state poisoned".into()))?,
                    };
                }
            }
        }
    }
}

impl Drop for SimulatedLineHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            for &offset in &self.offsets {
                if let Some(line) = state.lines.get_mut(offset as usize) {
                    if line.claim.is_some_and(|c| c.request == self.id) {
                        line.claim = None;
                    }
                }
            }
            state.queues.remove(&self.id);
        }
        debug!(chip = %self.shared.name, consumer = %self.consumer, "simulated lines released");
    }
}
