//! Configuration structures for the latency harness.
//!
//! Supports TOML deserialization with defaults matching the reference
//! bench wiring (LicheeRV-class board, GPIO bank 4).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Line controller selection.
    pub chip: ChipConfig,

    /// Edge responder settings.
    pub responder: ResponderConfig,

    /// Stimulus/capture node settings.
    pub stimulus: StimulusConfig,

    /// Real-time posture.
    pub realtime: RealtimeConfig,
}

/// Line controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChipConfig {
    /// Character device path of the controller.
    pub path: PathBuf,

    /// Consumer tag reported to the kernel for every request.
    pub consumer: String,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/gpiochip0"),
            consumer: String::from("gpio-rtt"),
        }
    }
}

/// Edge responder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Input line watched for the stimulus edge.
    pub input: LineOffset,

    /// Output line driven in response.
    pub output: LineOffset,

    /// Bias applied to the input line.
    pub input_bias: Bias,

    /// Treat the input as active-low.
    pub active_low: bool,

    /// How edges are detected.
    pub detection: EdgeDetection,

    /// Delay between level reads in polling mode.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on a single edge wait; `"none"` waits indefinitely.
    #[serde(with = "humantime_serde_opt")]
    pub wait_timeout: Option<Duration>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            input: LineOffset::bank_pin(4, 15),
            output: LineOffset::bank_pin(4, 12),
            input_bias: Bias::AsIs,
            active_low: false,
            detection: EdgeDetection::Blocking,
            poll_interval: Duration::from_micros(50),
            wait_timeout: Some(Duration::from_millis(100)),
        }
    }
}

/// Stimulus/capture node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    /// Line the stimulus pulse is emitted on.
    pub output: LineOffset,

    /// Line the responder's reply is captured on.
    pub input: LineOffset,

    /// Bias applied to the capture line.
    pub input_bias: Bias,

    /// Interval between stimulus pulses.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// How long the stimulus line is held active.
    #[serde(with = "humantime_serde")]
    pub pulse_width: Duration,

    /// Samples per statistics window (`N`).
    pub window_size: usize,

    /// Leading warm-up samples excluded from each window.
    pub skip: usize,

    /// Replies later than this after emission are rejected as stale.
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,

    /// Handling of missing or late replies.
    pub missed_reply: MissedReplyPolicy,

    /// Also aggregate the interval between successive replies.
    pub period_stats: bool,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            output: LineOffset::bank_pin(4, 16),
            input: LineOffset::bank_pin(4, 11),
            input_bias: Bias::AsIs,
            period: Duration::from_millis(10),
            pulse_width: Duration::from_micros(1),
            window_size: 102,
            skip: 2,
            capture_timeout: Duration::from_millis(5),
            missed_reply: MissedReplyPolicy::Reject,
            period_stats: true,
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Elevate scheduling at startup (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr", or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// IRQ numbers whose `irq/<n>-*` service threads get the same policy.
    pub irq_threads: Vec<u32>,

    /// CPU affinity for the measurement thread.
    pub cpu_affinity: CpuAffinity,

    /// Pre-fault stack size in bytes.
    pub prefault_stack_size: usize,

    /// Abort at startup if RT scheduling or memory locking is unavailable,
    /// instead of continuing with degraded determinism.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            priority: 99,
            lock_memory: true,
            irq_threads: Vec::new(),
            cpu_affinity: CpuAffinity::None,
            prefault_stack_size: 512 * 1024,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

impl SchedPolicy {
    /// True for the fixed-priority preemptive policies.
    #[must_use]
    pub fn is_realtime(self) -> bool {
        matches!(self, Self::Fifo | Self::Rr)
    }
}

/// Edge detection strategy for the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDetection {
    /// Block on kernel edge events.
    #[default]
    Blocking,
    /// Re-read the input level with a fixed delay between reads.
    Polling,
}

/// Edge-detection mode of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// No edge events.
    #[default]
    None,
    /// Inactive-to-active transitions.
    Rising,
    /// Active-to-inactive transitions.
    Falling,
    /// Both transitions.
    Both,
}

impl EdgeMode {
    /// Whether rising edges are reported.
    #[must_use]
    pub fn rising(self) -> bool {
        matches!(self, Self::Rising | Self::Both)
    }

    /// Whether falling edges are reported.
    #[must_use]
    pub fn falling(self) -> bool {
        matches!(self, Self::Falling | Self::Both)
    }
}

/// Internal bias resistor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Bias {
    /// Leave the controller's current setting.
    #[default]
    AsIs,
    /// Pull the line up.
    PullUp,
    /// Pull the line down.
    PullDown,
    /// Explicitly disable bias.
    Disabled,
}

/// What the capture side does with replies that do not match the
/// most recent emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissedReplyPolicy {
    /// Measure every reply against the latest emission, even if a reply
    /// went missing. Late replies corrupt the next sample.
    Absorb,
    /// One reply per emission within the capture timeout; late, duplicate,
    /// and missing replies are counted and excluded.
    #[default]
    Reject,
}

/// Line offset on a controller.
///
/// Accepts either a raw offset or `{ bank, pin }`, which maps to
/// `bank * 32 + pin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineOffset(pub u32);

impl LineOffset {
    /// Lines per bank in the `{ bank, pin }` notation.
    pub const PINS_PER_BANK: u32 = 32;

    /// Offset of `pin` within `bank`.
    #[must_use]
    pub const fn bank_pin(bank: u32, pin: u32) -> Self {
        Self(bank * Self::PINS_PER_BANK + pin)
    }

    /// Like [`bank_pin`](Self::bank_pin), but `None` when the offset does
    /// not fit in a `u32`.
    #[must_use]
    pub fn checked_bank_pin(bank: u32, pin: u32) -> Option<Self> {
        bank.checked_mul(Self::PINS_PER_BANK)
            .and_then(|base| base.checked_add(pin))
            .map(Self)
    }

    /// Raw controller offset.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LineOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LineOffset {
    fn from(offset: u32) -> Self {
        Self(offset)
    }
}

impl Serialize for LineOffset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for LineOffset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};

        struct LineOffsetVisitor;

        impl<'de> Visitor<'de> for LineOffsetVisitor {
            type Value = LineOffset;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a line offset or a { bank, pin } table")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u32::try_from(value)
                    .map(LineOffset)
                    .map_err(|_| de::Error::custom("line offset out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("line offset cannot be negative"));
                }
                self.visit_u64(value.unsigned_abs())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut bank = None;
                let mut pin = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "bank" => bank = Some(map.next_value::<u32>()?),
                        "pin" => pin = Some(map.next_value::<u32>()?),
                        other => {
                            return Err(de::Error::unknown_field(other, &["bank", "pin"]));
                        }
                    }
                }
                let bank = bank.ok_or_else(|| de::Error::missing_field("bank"))?;
                let pin = pin.ok_or_else(|| de::Error::missing_field("pin"))?;
                if pin >= LineOffset::PINS_PER_BANK {
                    return Err(de::Error::custom(format!(
                        "pin {pin} exceeds bank width {}",
                        LineOffset::PINS_PER_BANK
                    )));
                }
                LineOffset::checked_bank_pin(bank, pin)
                    .ok_or_else(|| de::Error::custom(format!("bank {bank} out of range")))
            }
        }

        deserializer.deserialize_any(LineOffsetVisitor)
    }
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            // TOML has no null; an empty set means "no affinity"
            CpuAffinity::None => serializer.collect_seq(std::iter::empty::<usize>()),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                usize::try_from(value)
                    .map(CpuAffinity::Single)
                    .map_err(|_| de::Error::custom("CPU index out of range"))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                self.visit_u64(value.unsigned_abs())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                if cpus.is_empty() {
                    return Ok(CpuAffinity::None);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.stimulus;
        if s.window_size == 0 {
            return Err(ConfigError::Invalid("stimulus.window_size must be > 0".into()));
        }
        if s.skip >= s.window_size {
            return Err(ConfigError::Invalid(format!(
                "stimulus.skip ({}) must be smaller than stimulus.window_size ({})",
                s.skip, s.window_size
            )));
        }
        if s.pulse_width >= s.period {
            return Err(ConfigError::Invalid(format!(
                "stimulus.pulse_width ({:?}) must be shorter than stimulus.period ({:?})",
                s.pulse_width, s.period
            )));
        }
        if s.input == s.output {
            return Err(ConfigError::Invalid(format!(
                "stimulus input and output share line {}",
                s.input
            )));
        }

        let r = &self.responder;
        if r.input == r.output {
            return Err(ConfigError::Invalid(format!(
                "responder input and output share line {}",
                r.input
            )));
        }
        if r.detection == EdgeDetection::Polling && r.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "responder.poll_interval must be non-zero in polling mode".into(),
            ));
        }

        let rt = &self.realtime;
        if rt.policy.is_realtime() && !(1..=99).contains(&rt.priority) {
            return Err(ConfigError::Invalid(format!(
                "realtime.priority {} outside 1..=99",
                rt.priority
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = rt.irq_threads.iter().find(|irq| !seen.insert(**irq)) {
            return Err(ConfigError::Invalid(format!(
                "realtime.irq_threads lists IRQ {dup} twice"
            )));
        }

        if self.chip.consumer.is_empty() {
            return Err(ConfigError::Invalid("chip.consumer must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parse but contradict each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Optional humantime duration; `"none"` or `"infinite"` means no bound.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_str("none"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.trim() {
            "none" | "infinite" => Ok(None),
            other => humantime::parse_duration(other)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
