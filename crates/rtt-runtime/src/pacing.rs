//! Fixed-period pacing on absolute `CLOCK_MONOTONIC` deadlines.
//!
//! Uses `clock_nanosleep` with `TIMER_ABSTIME` so wake-up error does not
//! accumulate across cycles. A cycle that finishes after the following
//! deadline has already passed is an overrun; the schedule is then re-based
//! on the current time instead of bursting to catch up.

use rtt_common::{duration_ns, monotonic_ns};
use std::time::Duration;
use tracing::warn;

/// Absolute-deadline period timer.
#[derive(Debug, Clone)]
pub struct Pacer {
    period_ns: u64,
    next_ns: u64,
    overruns: u64,
}

impl Pacer {
    /// Start a schedule whose first deadline is one period from now.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let period_ns = duration_ns(period).max(1);
        Self {
            period_ns,
            next_ns: monotonic_ns() + period_ns,
            overruns: 0,
        }
    }

    /// Cycles that missed their deadline.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Sleep until the next deadline and advance the schedule.
    ///
    /// Returns `false` if the sleep was cut short by a signal, in which case
    /// the deadline is kept so the caller can check its stop flag and retry.
    pub fn wait(&mut self) -> bool {
        let now = monotonic_ns();
        if now > self.next_ns + self.period_ns {
            self.overruns += 1;
            warn!(
                late_us = (now - self.next_ns) / 1_000,
                period_us = self.period_ns / 1_000,
                "Cycle overrun, re-basing schedule"
            );
            self.next_ns = now + self.period_ns;
            return true;
        }

        if !sleep_until(self.next_ns) {
            return false;
        }
        self.next_ns += self.period_ns;
        true
    }
}

/// Sleep until `deadline_ns` on `CLOCK_MONOTONIC`; `false` on EINTR.
#[cfg(target_os = "linux")]
fn sleep_until(deadline_ns: u64) -> bool {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};

    let deadline = TimeSpec::from_duration(Duration::from_nanos(deadline_ns));
    match clock_nanosleep(
        ClockId::CLOCK_MONOTONIC,
        ClockNanosleepFlags::TIMER_ABSTIME,
        &deadline,
    ) {
        Ok(_) => true,
        Err(Errno::EINTR) => false,
        Err(e) => {
            warn!(error = %e, "clock_nanosleep failed, falling back to thread sleep");
            std::thread::sleep(Duration::from_nanos(deadline_ns.saturating_sub(monotonic_ns())));
            true
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_until(deadline_ns: u64) -> bool {
    let now = monotonic_ns();
    if deadline_ns > now {
        std::thread::sleep(Duration::from_nanos(deadline_ns - now));
    }
    true
}

/// Spin for `hold` without yielding the CPU.
pub fn busy_wait(hold: Duration) {
    let until = monotonic_ns() + duration_ns(hold);
    while monotonic_ns() < until {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paced_cycles() {
        let start = monotonic_ns();
        let mut pacer = Pacer::new(Duration::from_millis(2));
        for _ in 0..3 {
            while !pacer.wait() {}
        }
        let elapsed = monotonic_ns() - start;
        assert!(elapsed >= 6_000_000, "elapsed {elapsed} ns");
    }

    #[test]
    fn test_overrun_rebases() {
        let mut pacer = Pacer::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(pacer.wait());
        assert_eq!(pacer.overruns(), 1);
    }

    #[test]
    fn test_busy_wait_holds() {
        let start = monotonic_ns();
        busy_wait(Duration::from_micros(200));
        assert!(monotonic_ns() - start >= 200_000);
    }
}
