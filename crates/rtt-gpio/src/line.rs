//! Line request model.
//!
//! A request names a consumer and a set of lines, each with its own
//! direction, edge detection, bias, and polarity. Validation happens before
//! any controller is touched so a malformed request never leaves partial
//! hardware state behind.

use rtt_common::{Bias, EdgeMode, RttError, RttResult};
use std::collections::HashSet;

/// Maximum lines in one request (GPIO v2 uAPI limit).
pub const MAX_LINES: usize = 64;

/// Maximum consumer tag length including the NUL terminator.
pub const MAX_CONSUMER_LEN: usize = 32;

/// Line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Line is read (and may report edges).
    Input,
    /// Line is driven.
    Output,
}

/// Settings for a single line within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Controller offset.
    pub offset: u32,
    /// Direction.
    pub direction: Direction,
    /// Edge detection (inputs only).
    pub edge: EdgeMode,
    /// Bias resistor configuration.
    pub bias: Bias,
    /// Active level is physical low.
    pub active_low: bool,
    /// Initial logical level (outputs only).
    pub initial: bool,
}

impl LineSettings {
    /// An input line with no edge detection.
    #[must_use]
    pub fn input(offset: u32) -> Self {
        Self {
            offset,
            direction: Direction::Input,
            edge: EdgeMode::None,
            bias: Bias::AsIs,
            active_low: false,
            initial: false,
        }
    }

    /// An output line starting at `initial`.
    #[must_use]
    pub fn output(offset: u32, initial: bool) -> Self {
        Self {
            offset,
            direction: Direction::Output,
            edge: EdgeMode::None,
            bias: Bias::AsIs,
            active_low: false,
            initial,
        }
    }

    /// Set edge detection.
    #[must_use]
    pub fn with_edge(mut self, edge: EdgeMode) -> Self {
        self.edge = edge;
        self
    }

    /// Set bias.
    #[must_use]
    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    /// Set polarity.
    #[must_use]
    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    /// Whether this line reports edge events.
    #[must_use]
    pub fn detects_edges(&self) -> bool {
        self.edge != EdgeMode::None
    }
}

/// A complete line request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequestConfig {
    /// Consumer tag shown by the controller for claimed lines.
    pub consumer: String,
    /// Per-line settings, in request order.
    pub lines: Vec<LineSettings>,
    /// Kernel edge event buffer size; 0 selects the controller default.
    pub event_buffer_size: u32,
}

impl LineRequestConfig {
    /// Start an empty request.
    #[must_use]
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            lines: Vec::new(),
            event_buffer_size: 0,
        }
    }

    /// Add a line.
    #[must_use]
    pub fn line(mut self, settings: LineSettings) -> Self {
        self.lines.push(settings);
        self
    }

    /// Build a request from parallel per-line arrays.
    ///
    /// # Errors
    ///
    /// Returns [`RttError::Config`] if the arrays differ in length or the
    /// resulting request fails [`LineRequestConfig::validate`].
    pub fn from_parts(
        consumer: &str,
        offsets: &[u32],
        directions: &[Direction],
        edges: &[EdgeMode],
        bias: &[Bias],
        active_low: &[bool],
    ) -> RttResult<Self> {
        let n = offsets.len();
        if directions.len() != n || edges.len() != n || bias.len() != n || active_low.len() != n {
            return Err(RttError::Config(format!(
                "per-line arrays disagree: {} offsets, {} directions, {} edge modes, {} biases, {} polarities",
                n,
                directions.len(),
                edges.len(),
                bias.len(),
                active_low.len()
            )));
        }

        let lines = (0..n)
            .map(|i| LineSettings {
                offset: offsets[i],
                direction: directions[i],
                edge: edges[i],
                bias: bias[i],
                active_low: active_low[i],
                initial: false,
            })
            .collect();

        let config = Self {
            consumer: consumer.to_string(),
            lines,
            event_buffer_size: 0,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the request is well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`RttError::Config`] for an empty or oversized request, a
    /// duplicate offset, an invalid consumer tag, or edge detection on an
    /// output line.
    pub fn validate(&self) -> RttResult<()> {
        if self.lines.is_empty() {
            return Err(RttError::Config("request names no lines".into()));
        }
        if self.lines.len() > MAX_LINES {
            return Err(RttError::Config(format!(
                "request names {} lines (limit {MAX_LINES})",
                self.lines.len()
            )));
        }
        if self.consumer.is_empty()
            || self.consumer.len() >= MAX_CONSUMER_LEN
            || self.consumer.contains('\0')
        {
            return Err(RttError::Config(format!(
                "consumer tag {:?} must be 1-{} bytes without NUL",
                self.consumer,
                MAX_CONSUMER_LEN - 1
            )));
        }

        let mut seen = HashSet::with_capacity(self.lines.len());
        for line in &self.lines {
            if !seen.insert(line.offset) {
                return Err(RttError::Config(format!(
                    "line {} appears twice in one request",
                    line.offset
                )));
            }
            if line.direction == Direction::Output && line.detects_edges() {
                return Err(RttError::Config(format!(
                    "edge detection requested on output line {}",
                    line.offset
                )));
            }
        }
        Ok(())
    }

    /// Offsets in request order.
    #[must_use]
    pub fn offsets(&self) -> Vec<u32> {
        self.lines.iter().map(|l| l.offset).collect()
    }

    /// Settings for `offset`, if it is part of the request.
    #[must_use]
    pub fn settings(&self, offset: u32) -> Option<&LineSettings> {
        self.lines.iter().find(|l| l.offset == offset)
    }
}

/// Error for an offset the handle does not hold.
pub(crate) fn not_requested(offset: u32) -> RttError {
    RttError::ResourceUnavailable(format!("line {offset} is not part of this request"))
}
