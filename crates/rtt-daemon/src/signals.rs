//! Signal handling for a clean stop.
//!
//! SIGINT and SIGTERM set a process-wide stop flag. The handlers are
//! installed without `SA_RESTART`, so a thread blocked in an edge wait or an
//! absolute sleep returns with EINTR and gets to check the flag.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use tracing::debug;

/// Signal types that stop the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signo: i32) -> Option<Self> {
        match signo {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Stop flag plus diagnostics, written from the signal handler.
///
/// Only atomics, so every method is async-signal-safe.
#[derive(Debug)]
pub struct SignalState {
    stop: AtomicBool,
    signal_count: AtomicU32,
    last_signal: AtomicI32,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    /// Fresh state with the flag clear.
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            signal_count: AtomicU32::new(0),
            last_signal: AtomicI32::new(0),
        }
    }

    /// The flag measurement loops poll.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// Whether a stop has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn record_signal(&self, signo: i32) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(signo, Ordering::Relaxed);
        self.stop.store(true, Ordering::Release);
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Most recent stop signal.
    pub fn last_signal(&self) -> Option<SignalKind> {
        SignalKind::from_raw(self.last_signal.load(Ordering::Relaxed))
    }
}

static STATE: SignalState = SignalState::new();

extern "C" fn on_stop_signal(signo: libc::c_int) {
    STATE.record_signal(signo);
}

/// Handle on the installed process-wide handlers.
#[derive(Debug, Clone, Copy)]
pub struct SignalHandler {
    state: &'static SignalState,
}

impl SignalHandler {
    /// Install the SIGINT/SIGTERM handlers.
    ///
    /// # Errors
    ///
    /// The errno from `sigaction`.
    #[allow(unsafe_code)]
    pub fn install() -> nix::Result<Self> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        // No SA_RESTART: blocking waits must come back with EINTR.
        let action = SigAction::new(
            SigHandler::Handler(on_stop_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only touches atomics.
            unsafe { sigaction(signal, &action) }?;
        }

        debug!("SIGINT/SIGTERM handlers installed");
        Ok(Self { state: &STATE })
    }

    /// The process-wide stop flag.
    pub fn stop_flag(&self) -> &'static AtomicBool {
        self.state.stop_flag()
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        self.state
    }
}
