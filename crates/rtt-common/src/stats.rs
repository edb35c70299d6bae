//! Fixed-capacity sample window and latency statistics.
//!
//! The window is allocated once and never grows; appends are O(1) and
//! allocation-free so they can run from the capture path. When the window is
//! full the owner drains it: statistics are computed over the samples after
//! the warm-up prefix and the fill index returns to zero.

use crate::error::{RttError, RttResult};
use serde::Serialize;
use std::fmt;

/// Fixed-capacity window of interval samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    /// Sample storage; entries past `fill` are stale.
    samples: Box<[u64]>,
    /// Number of valid samples (next write position).
    fill: usize,
}

impl SampleWindow {
    /// Create a window holding `capacity` samples (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            fill: 0,
        }
    }

    /// Window capacity `N`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Current fill index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fill
    }

    /// True when no samples have been appended since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// True when the fill index has reached capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.fill == self.samples.len()
    }

    /// Append a sample.
    ///
    /// Returns `false` without modifying the window when it is already full;
    /// the owner must drain before appending further.
    #[inline]
    #[must_use]
    pub fn append(&mut self, sample: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.samples[self.fill] = sample;
        self.fill += 1;
        true
    }

    /// Samples appended since the last reset, in order.
    #[must_use]
    pub fn samples(&self) -> &[u64] {
        &self.samples[..self.fill]
    }

    /// Compute statistics over samples `[skip, len)`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `skip` leaves no samples.
    pub fn compute(&self, skip: usize) -> RttResult<LatencyStatistics> {
        if skip >= self.fill {
            return Err(RttError::Config(format!(
                "skip {skip} leaves no samples (window holds {})",
                self.fill
            )));
        }
        Ok(LatencyStatistics::from_samples(&self.samples[skip..self.fill]))
    }

    /// Compute statistics then reset the fill index.
    ///
    /// The window is reset even when the computation fails so the next
    /// `capacity()` appends always refill it.
    ///
    /// # Errors
    ///
    /// Same as [`SampleWindow::compute`].
    pub fn drain(&mut self, skip: usize) -> RttResult<LatencyStatistics> {
        let stats = self.compute(skip);
        self.reset();
        stats
    }

    /// Reset the fill index; storage is overwritten by later appends.
    pub fn reset(&mut self) {
        self.fill = 0;
    }
}

/// Mean and RMS deviation of a retained sample range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStatistics {
    /// Number of samples the statistics cover.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Root-mean-square deviation from the mean.
    pub rms: f64,
    /// Smallest sample.
    pub min: u64,
    /// Largest sample.
    pub max: u64,
}

impl LatencyStatistics {
    /// Compute statistics over a non-empty slice.
    ///
    /// An empty slice yields NaN mean and deviation.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(samples: &[u64]) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self {
                count: 0,
                mean: f64::NAN,
                rms: f64::NAN,
                min: 0,
                max: 0,
            };
        }

        let sum: u128 = samples.iter().map(|&s| u128::from(s)).sum();
        let mean = sum as f64 / count as f64;

        let sq_dev: f64 = samples
            .iter()
            .map(|&s| {
                let d = s as f64 - mean;
                d * d
            })
            .sum();
        let rms = (sq_dev / count as f64).sqrt();

        Self {
            count,
            mean,
            rms,
            min: samples.iter().copied().min().unwrap_or(0),
            max: samples.iter().copied().max().unwrap_or(0),
        }
    }

    /// Peak-to-peak spread (max - min).
    #[must_use]
    pub fn spread(&self) -> u64 {
        self.max - self.min
    }

    /// Express the statistics in a coarser unit, e.g. nanoseconds to
    /// microseconds with `divisor = 1000.0`. Min/max are truncated.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaled(&self, divisor: f64) -> ScaledStatistics {
        ScaledStatistics {
            count: self.count,
            mean: self.mean / divisor,
            rms: self.rms / divisor,
            min: self.min as f64 / divisor,
            max: self.max as f64 / divisor,
        }
    }
}

/// Statistics converted to a reporting unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaledStatistics {
    /// Number of samples.
    pub count: usize,
    /// Mean in the reporting unit.
    pub mean: f64,
    /// RMS deviation in the reporting unit.
    pub rms: f64,
    /// Minimum in the reporting unit.
    pub min: f64,
    /// Maximum in the reporting unit.
    pub max: f64,
}

impl fmt::Display for ScaledStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AVG: {:.2} us    RMS: {:.2} us", self.mean, self.rms)
    }
}
