//! Linux GPIO v2 character-device controller (`/dev/gpiochipN`).
//!
//! Lines are requested with `GPIO_V2_GET_LINE_IOCTL`; the kernel returns a
//! request descriptor that carries level get/set ioctls and delivers
//! `gpio_v2_line_event` records for edge detection. Event timestamps are
//! `CLOCK_MONOTONIC` unless the request asks otherwise, which it never does.

#![allow(unsafe_code)] // ioctl and raw descriptor handling

use crate::line::{not_requested, Direction, LineRequestConfig, LineSettings};
use crate::{Edge, EdgeEvent, EdgeWait, LineController, LineHandle};
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use rtt_common::{Bias, Clock, MonotonicClock, RttError, RttResult};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

/// Kernel uAPI structures and ioctls (`include/uapi/linux/gpio.h`).
mod uapi {
    use static_assertions::const_assert_eq;

    pub const MAX_ATTRS: usize = 10;

    pub const FLAG_ACTIVE_LOW: u64 = 1 << 1;
    pub const FLAG_INPUT: u64 = 1 << 2;
    pub const FLAG_OUTPUT: u64 = 1 << 3;
    pub const FLAG_EDGE_RISING: u64 = 1 << 4;
    pub const FLAG_EDGE_FALLING: u64 = 1 << 5;
    pub const FLAG_BIAS_PULL_UP: u64 = 1 << 8;
    pub const FLAG_BIAS_PULL_DOWN: u64 = 1 << 9;
    pub const FLAG_BIAS_DISABLED: u64 = 1 << 10;

    pub const ATTR_ID_FLAGS: u32 = 1;
    pub const ATTR_ID_OUTPUT_VALUES: u32 = 2;

    pub const EVENT_RISING_EDGE: u32 = 1;
    pub const EVENT_FALLING_EDGE: u32 = 2;

    /// `struct gpio_v2_line_attribute`; the union is carried as `u64`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LineAttribute {
        pub id: u32,
        pub padding: u32,
        pub value: u64,
    }

    /// `struct gpio_v2_line_config_attribute`
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LineConfigAttribute {
        pub attr: LineAttribute,
        pub mask: u64,
    }

    /// `struct gpio_v2_line_config`
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LineConfig {
        pub flags: u64,
        pub num_attrs: u32,
        pub padding: [u32; 5],
        pub attrs: [LineConfigAttribute; MAX_ATTRS],
    }

    /// `struct gpio_v2_line_request`
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct LineRequest {
        pub offsets: [u32; 64],
        pub consumer: [u8; 32],
        pub config: LineConfig,
        pub num_lines: u32,
        pub event_buffer_size: u32,
        pub padding: [u32; 5],
        pub fd: i32,
    }

    impl Default for LineRequest {
        fn default() -> Self {
            Self {
                offsets: [0; 64],
                consumer: [0; 32],
                config: LineConfig::default(),
                num_lines: 0,
                event_buffer_size: 0,
                padding: [0; 5],
                fd: -1,
            }
        }
    }

    /// `struct gpio_v2_line_values`
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LineValues {
        pub bits: u64,
        pub mask: u64,
    }

    /// Size of `struct gpio_v2_line_event`.
    pub const LINE_EVENT_SIZE: usize = 48;

    const_assert_eq!(std::mem::size_of::<LineAttribute>(), 16);
    const_assert_eq!(std::mem::size_of::<LineConfigAttribute>(), 24);
    const_assert_eq!(std::mem::size_of::<LineConfig>(), 272);
    const_assert_eq!(std::mem::size_of::<LineRequest>(), 592);
    const_assert_eq!(std::mem::size_of::<LineValues>(), 16);

    nix::ioctl_readwrite!(get_line, 0xB4, 0x07, LineRequest);
    nix::ioctl_readwrite!(get_values, 0xB4, 0x0E, LineValues);
    nix::ioctl_readwrite!(set_values, 0xB4, 0x0F, LineValues);
}

/// uAPI flag word for one line.
fn line_flags(settings: &LineSettings) -> u64 {
    let mut flags = match settings.direction {
        Direction::Input => uapi::FLAG_INPUT,
        Direction::Output => uapi::FLAG_OUTPUT,
    };
    if settings.active_low {
        flags |= uapi::FLAG_ACTIVE_LOW;
    }
    if settings.edge.rising() {
        flags |= uapi::FLAG_EDGE_RISING;
    }
    if settings.edge.falling() {
        flags |= uapi::FLAG_EDGE_FALLING;
    }
    flags |= match settings.bias {
        Bias::AsIs => 0,
        Bias::PullUp => uapi::FLAG_BIAS_PULL_UP,
        Bias::PullDown => uapi::FLAG_BIAS_PULL_DOWN,
        Bias::Disabled => uapi::FLAG_BIAS_DISABLED,
    };
    flags
}

/// Encode a validated request into the kernel layout.
///
/// The first line's flags become the default; lines that differ are covered
/// by `FLAGS` attributes, and initial output levels by one `OUTPUT_VALUES`
/// attribute.
fn encode_request(config: &LineRequestConfig) -> RttResult<uapi::LineRequest> {
    let mut req = uapi::LineRequest::default();

    for (i, settings) in config.lines.iter().enumerate() {
        req.offsets[i] = settings.offset;
    }
    let consumer = config.consumer.as_bytes();
    req.consumer[..consumer.len()].copy_from_slice(consumer);
    req.num_lines = u32::try_from(config.lines.len())
        .map_err(|_| RttError::Config("too many lines".into()))?;
    req.event_buffer_size = config.event_buffer_size;

    let default_flags = config.lines.first().map_or(0, line_flags);
    req.config.flags = default_flags;

    let mut attrs: Vec<uapi::LineConfigAttribute> = Vec::new();
    for (i, settings) in config.lines.iter().enumerate() {
        let flags = line_flags(settings);
        if flags == default_flags {
            continue;
        }
        let bit = 1u64 << i;
        match attrs
            .iter_mut()
            .find(|a| a.attr.id == uapi::ATTR_ID_FLAGS && a.attr.value == flags)
        {
            Some(existing) => existing.mask |= bit,
            None => attrs.push(uapi::LineConfigAttribute {
                attr: uapi::LineAttribute {
                    id: uapi::ATTR_ID_FLAGS,
                    padding: 0,
                    value: flags,
                },
                mask: bit,
            }),
        }
    }

    let mut out_mask = 0u64;
    let mut out_bits = 0u64;
    for (i, settings) in config.lines.iter().enumerate() {
        if settings.direction == Direction::Output {
            out_mask |= 1 << i;
            if settings.initial {
                out_bits |= 1 << i;
            }
        }
    }
    if out_mask != 0 {
        attrs.push(uapi::LineConfigAttribute {
            attr: uapi::LineAttribute {
                id: uapi::ATTR_ID_OUTPUT_VALUES,
                padding: 0,
                value: out_bits,
            },
            mask: out_mask,
        });
    }

    if attrs.len() > uapi::MAX_ATTRS {
        return Err(RttError::Config(format!(
            "request needs {} line attributes (limit {})",
            attrs.len(),
            uapi::MAX_ATTRS
        )));
    }
    req.config.attrs[..attrs.len()].copy_from_slice(&attrs);
    req.config.num_attrs = u32::try_from(attrs.len()).unwrap_or(0);

    Ok(req)
}

/// Decode one `gpio_v2_line_event` record.
fn decode_event(buf: &[u8; uapi::LINE_EVENT_SIZE]) -> RttResult<EdgeEvent> {
    fn u32_at(buf: &[u8], at: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[at..at + 4]);
        u32::from_ne_bytes(b)
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&buf[0..8]);

    let edge = match u32_at(buf, 8) {
        uapi::EVENT_RISING_EDGE => Edge::Rising,
        uapi::EVENT_FALLING_EDGE => Edge::Falling,
        other => return Err(RttError::Io(format!("unknown line event id {other}"))),
    };

    Ok(EdgeEvent {
        offset: u32_at(buf, 12),
        edge,
        timestamp_ns: u64::from_ne_bytes(ts),
        seqno: u32_at(buf, 16),
    })
}

/// GPIO character device.
#[derive(Debug)]
pub struct CdevChip {
    path: PathBuf,
    name: String,
    file: File,
}

impl CdevChip {
    /// Open a chip device.
    ///
    /// # Errors
    ///
    /// `Device` if the path cannot be opened read-write.
    pub fn open(path: impl AsRef<Path>) -> RttResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RttError::Device(format!("{}: {e}", path.display())))?;
        debug!(chip = %path.display(), "GPIO chip opened");
        Ok(Self {
            name: path.display().to_string(),
            path,
            file,
        })
    }

    /// Device path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LineController for CdevChip {
    fn name(&self) -> &str {
        &self.name
    }

    // Requests never set GPIO_V2_LINE_FLAG_EVENT_CLOCK_*, so the kernel
    // stamps events with CLOCK_MONOTONIC.
    fn timestamp_clock(&self) -> Box<dyn Clock> {
        Box::new(MonotonicClock)
    }

    fn request(&self, config: &LineRequestConfig) -> RttResult<Box<dyn LineHandle>> {
        config.validate()?;

        let mut req = encode_request(config)?;

        // SAFETY: `req` is a fully initialised `gpio_v2_line_request` and the
        // chip descriptor is open for the duration of the call.
        let result = unsafe { uapi::get_line(self.file.as_raw_fd(), &mut req) };
        if let Err(errno) = result {
            return Err(match errno {
                Errno::EBUSY => RttError::ResourceUnavailable(format!(
                    "lines {:?} on {} already requested",
                    config.offsets(),
                    self.name
                )),
                Errno::EINVAL => RttError::Config(format!(
                    "{} rejected line request {:?}",
                    self.name,
                    config.offsets()
                )),
                other => RttError::Io(format!("line request on {}: {other}", self.name)),
            });
        }
        if req.fd < 0 {
            return Err(RttError::Io(format!(
                "line request on {} returned no descriptor",
                self.name
            )));
        }

        // SAFETY: the kernel returned a fresh descriptor owned by this request.
        let fd = unsafe { OwnedFd::from_raw_fd(req.fd) };

        debug!(
            chip = %self.name,
            consumer = %config.consumer,
            offsets = ?config.offsets(),
            "lines requested"
        );

        Ok(Box::new(CdevLineHandle {
            file: File::from(fd),
            consumer: config.consumer.clone(),
            offsets: config.offsets(),
            directions: config.lines.iter().map(|l| l.direction).collect(),
        }))
    }
}

/// Request descriptor returned by the kernel; closing it releases the lines.
#[derive(Debug)]
struct CdevLineHandle {
    file: File,
    consumer: String,
    offsets: Vec<u32>,
    directions: Vec<Direction>,
}

impl CdevLineHandle {
    fn index(&self, offset: u32) -> RttResult<usize> {
        self.offsets
            .iter()
            .position(|&o| o == offset)
            .ok_or_else(|| not_requested(offset))
    }
}

impl LineHandle for CdevLineHandle {
    fn consumer(&self) -> &str {
        &self.consumer
    }

    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn read(&mut self, offset: u32) -> RttResult<bool> {
        let bit = 1u64 << self.index(offset)?;
        let mut values = uapi::LineValues { bits: 0, mask: bit };
        // SAFETY: `values` is a valid `gpio_v2_line_values` on our request fd.
        unsafe { uapi::get_values(self.file.as_raw_fd(), &mut values) }
            .map_err(|e| RttError::Io(format!("read line {offset}: {e}")))?;
        Ok(values.bits & bit != 0)
    }

    fn write(&mut self, offset: u32, active: bool) -> RttResult<()> {
        let idx = self.index(offset)?;
        if self.directions[idx] != Direction::Output {
            return Err(RttError::Io(format!("line {offset} is an input")));
        }
        let bit = 1u64 << idx;
        let mut values = uapi::LineValues {
            bits: if active { bit } else { 0 },
            mask: bit,
        };
        // SAFETY: `values` is a valid `gpio_v2_line_values` on our request fd.
        unsafe { uapi::set_values(self.file.as_raw_fd(), &mut values) }
            .map_err(|e| RttError::Io(format!("write line {offset}: {e}")))?;
        Ok(())
    }

    fn wait_edge(&mut self, timeout: Option<Duration>) -> RttResult<EdgeWait> {
        let ready = {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match ppoll(&mut fds, timeout.map(TimeSpec::from_duration), None) {
                Ok(n) => n,
                Err(Errno::EINTR) => return Ok(EdgeWait::Interrupted),
                Err(e) => return Err(RttError::Io(format!("poll line events: {e}"))),
            }
        };
        if ready == 0 {
            return Ok(EdgeWait::Timeout);
        }

        let mut buf = [0u8; uapi::LINE_EVENT_SIZE];
        match self.file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                return Ok(EdgeWait::Interrupted)
            }
            Err(e) => return Err(RttError::Io(format!("read line event: {e}"))),
        }

        let event = decode_event(&buf)?;
        trace!(offset = event.offset, edge = %event.edge, ts = event.timestamp_ns, "line event");
        Ok(EdgeWait::Event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtt_common::EdgeMode;

    #[test]
    fn test_flags() {
        let input = LineSettings::input(0)
            .with_edge(EdgeMode::Both)
            .with_bias(Bias::PullDown)
            .with_active_low(true);
        let flags = line_flags(&input);
        assert_eq!(
            flags,
            uapi::FLAG_INPUT
                | uapi::FLAG_ACTIVE_LOW
                | uapi::FLAG_EDGE_RISING
                | uapi::FLAG_EDGE_FALLING
                | uapi::FLAG_BIAS_PULL_DOWN
        );
        assert_eq!(line_flags(&LineSettings::output(1, false)), uapi::FLAG_OUTPUT);
    }

    #[test]
    fn test_encode_mixed_request() {
        let config = LineRequestConfig::new("gpio-rtt")
            .line(LineSettings::input(143).with_edge(EdgeMode::Both))
            .line(LineSettings::output(140, true));
        let req = encode_request(&config).unwrap();

        assert_eq!(req.num_lines, 2);
        assert_eq!(&req.offsets[..2], &[143, 140]);
        assert_eq!(&req.consumer[..8], b"gpio-rtt");
        assert_eq!(req.consumer[8], 0);
        assert_eq!(
            req.config.flags,
            uapi::FLAG_INPUT | uapi::FLAG_EDGE_RISING | uapi::FLAG_EDGE_FALLING
        );
        assert_eq!(req.config.num_attrs, 2);

        let flags_attr = req.config.attrs[0];
        assert_eq!(flags_attr.attr.id, uapi::ATTR_ID_FLAGS);
        assert_eq!(flags_attr.attr.value, uapi::FLAG_OUTPUT);
        assert_eq!(flags_attr.mask, 0b10);

        let values_attr = req.config.attrs[1];
        assert_eq!(values_attr.attr.id, uapi::ATTR_ID_OUTPUT_VALUES);
        assert_eq!(values_attr.attr.value, 0b10);
        assert_eq!(values_attr.mask, 0b10);
    }

    #[test]
    fn test_decode_event() {
        let mut buf = [0u8; uapi::LINE_EVENT_SIZE];
        buf[0..8].copy_from_slice(&1_234_567_u64.to_ne_bytes());
        buf[8..12].copy_from_slice(&uapi::EVENT_FALLING_EDGE.to_ne_bytes());
        buf[12..16].copy_from_slice(&143_u32.to_ne_bytes());
        buf[16..20].copy_from_slice(&9_u32.to_ne_bytes());

        let event = decode_event(&buf).unwrap();
        assert_eq!(event.edge, Edge::Falling);
        assert_eq!(event.offset, 143);
        assert_eq!(event.timestamp_ns, 1_234_567);
        assert_eq!(event.seqno, 9);

        buf[8..12].copy_from_slice(&7_u32.to_ne_bytes());
        assert!(matches!(decode_event(&buf), Err(RttError::Io(_))));
    }

    #[test]
    fn test_open_missing_chip() {
        let result = CdevChip::open("/dev/gpiochip-does-not-exist");
        assert!(matches!(result, Err(RttError::Device(_))));
    }

    #[test]
    #[ignore = "requires /dev/gpiochip0"]
    fn test_hardware_request() {
        let chip = CdevChip::open("/dev/gpiochip0").unwrap();
        let mut lines = chip
            .request(&LineRequestConfig::new("gpio-rtt-test").line(LineSettings::input(0)))
            .unwrap();
        assert!(lines.read(0).is_ok());
    }
}
