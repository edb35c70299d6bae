//! Digital line access for the latency harness.
//!
//! This crate provides:
//! - [`LineController`] / [`LineHandle`] traits abstracting exclusive line requests
//! - [`line`] module with the request model (direction, edge mode, bias, polarity)
//! - [`cdev`] module with the Linux GPIO v2 character-device controller
//! - [`simulated`] module with an in-memory controller for tests and dry runs
//! - [`edge`] module with the blocking and polling edge sources

#[cfg(target_os = "linux")]
pub mod cdev;
pub mod edge;
pub mod line;
#[cfg(feature = "simulated")]
pub mod simulated;

#[cfg(target_os = "linux")]
pub use cdev::CdevChip;
pub use edge::*;
pub use line::*;
#[cfg(feature = "simulated")]
pub use simulated::{SimClock, SimulatedChip};

use rtt_common::{Clock, RttResult};
use std::fmt;
use std::time::Duration;

/// Direction of a detected transition, in logical (active-level) terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Inactive to active.
    Rising,
    /// Active to inactive.
    Falling,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Rising => write!(f, "rising"),
            Edge::Falling => write!(f, "falling"),
        }
    }
}

/// A detected transition on one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Controller offset of the line.
    pub offset: u32,
    /// Transition direction.
    pub edge: Edge,
    /// `CLOCK_MONOTONIC` nanoseconds on the observing node.
    pub timestamp_ns: u64,
    /// Sequence number across the request.
    pub seqno: u32,
}

/// Outcome of a bounded edge wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWait {
    /// An edge arrived.
    Event(EdgeEvent),
    /// The timeout elapsed with nothing pending.
    Timeout,
    /// A signal interrupted the wait.
    Interrupted,
}

/// An exclusive request for one or more lines.
///
/// Dropping the handle releases every line it holds.
pub trait LineHandle: Send {
    /// Consumer tag the request was made under.
    fn consumer(&self) -> &str;

    /// Offsets held by this request, in request order.
    fn offsets(&self) -> &[u32];

    /// Whether `offset` belongs to this request.
    fn contains(&self, offset: u32) -> bool {
        self.offsets().contains(&offset)
    }

    /// Read the logical level of a held line.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` for a foreign offset, `Io` on syscall failure.
    fn read(&mut self, offset: u32) -> RttResult<bool>;

    /// Drive a held output line to a logical level.
    ///
    /// # Errors
    ///
    /// `ResourceUnavailable` for a foreign offset, `Io` if the line is an
    /// input or the syscall fails.
    fn write(&mut self, offset: u32, active: bool) -> RttResult<()>;

    /// Wait for the next edge on any edge-detecting line of the request.
    ///
    /// `None` waits indefinitely; a zero timeout never blocks.
    ///
    /// # Errors
    ///
    /// `Io` on syscall failure.
    fn wait_edge(&mut self, timeout: Option<Duration>) -> RttResult<EdgeWait>;
}

/// A line controller that hands out exclusive requests.
pub trait LineController {
    /// Human-readable controller identity (device path or simulated name).
    fn name(&self) -> &str;

    /// Request the lines described by `config`.
    ///
    /// # Errors
    ///
    /// `Config` for a malformed request, `ResourceUnavailable` if any line is
    /// already claimed or does not exist, `Io` for other controller failures.
    fn request(&self, config: &LineRequestConfig) -> RttResult<Box<dyn LineHandle>>;

    /// The clock [`EdgeEvent::timestamp_ns`] is taken on. Anything compared
    /// against edge timestamps must read this clock.
    fn timestamp_clock(&self) -> Box<dyn Clock>;
}
