//! 4.A Precision timer.
//!
//! A single wait-free operation, [`PrecisionTimer::now_ns`], backed by the
//! best monotonic source available on this machine. Sources are probed in
//! order of preference at construction time: invariant TSC (calibrated
//! against `CLOCK_MONOTONIC`), `CLOCK_MONOTONIC_RAW`, `CLOCK_MONOTONIC`.
//! Initialization fails only if no monotonic source exists at all.

use anyhow::{Context, Result, anyhow};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    InvariantTsc,
    MonotonicRaw,
    Monotonic,
}

impl ClockSource {
    pub fn name(&self) -> &'static str {
        match self {
            ClockSource::InvariantTsc => "invariant-tsc",
            ClockSource::MonotonicRaw => "monotonic-raw",
            ClockSource::Monotonic => "monotonic",
        }
    }
}

/// Monotonic nanosecond timestamp source.
pub struct PrecisionTimer {
    source: ClockSource,
    /// Nanoseconds per TSC tick; only meaningful when `source == InvariantTsc`.
    tsc_ns_per_tick: f64,
    /// TSC value and matching monotonic-ns reading taken at calibration time.
    tsc_origin: u64,
    ns_origin: u64,
}

fn clock_gettime_ns(clock_id: libc::clockid_t) -> Result<u64> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        return Err(anyhow!(std::io::Error::last_os_error()).context("clock_gettime failed"));
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(target_arch = "x86_64")]
fn read_tsc() -> u64 {
    // SAFETY: RDTSC is available on every x86_64 CPU that runs Rust's std.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86_64")]
fn tsc_is_invariant() -> bool {
    // CPUID leaf 0x80000007, bit 8 of EDX reports invariant TSC support.
    let result = unsafe { core::arch::x86_64::__cpuid(0x8000_0007) };
    result.edx & (1 << 8) != 0
}

#[cfg(not(target_arch = "x86_64"))]
fn tsc_is_invariant() -> bool {
    false
}

impl PrecisionTimer {
    /// Probes available clock sources and builds a timer using the best one.
    pub fn probe() -> Result<Self> {
        #[cfg(target_arch = "x86_64")]
        if tsc_is_invariant() {
            if let Some(timer) = Self::calibrate_tsc()? {
                return Ok(timer);
            }
        }

        if let Ok(ns) = clock_gettime_ns(libc::CLOCK_MONOTONIC_RAW) {
            return Ok(Self {
                source: ClockSource::MonotonicRaw,
                tsc_ns_per_tick: 0.0,
                tsc_origin: 0,
                ns_origin: ns,
            });
        }

        let ns = clock_gettime_ns(libc::CLOCK_MONOTONIC).context("no monotonic clock source available")?;
        Ok(Self {
            source: ClockSource::Monotonic,
            tsc_ns_per_tick: 0.0,
            tsc_origin: 0,
            ns_origin: ns,
        })
    }

    #[cfg(target_arch = "x86_64")]
    fn calibrate_tsc() -> Result<Option<Self>> {
        // Calibrate against CLOCK_MONOTONIC over a short warm-up window.
        let calibration_window = std::time::Duration::from_millis(10);

        let ns_before = match clock_gettime_ns(libc::CLOCK_MONOTONIC) {
            Ok(ns) => ns,
            Err(_) => return Ok(None),
        };
        let tsc_before = read_tsc();

        std::thread::sleep(calibration_window);

        let ns_after = clock_gettime_ns(libc::CLOCK_MONOTONIC)?;
        let tsc_after = read_tsc();

        let elapsed_ns = ns_after.saturating_sub(ns_before);
        let elapsed_ticks = tsc_after.saturating_sub(tsc_before);
        if elapsed_ticks == 0 || elapsed_ns == 0 {
            return Ok(None);
        }

        Ok(Some(Self {
            source: ClockSource::InvariantTsc,
            tsc_ns_per_tick: elapsed_ns as f64 / elapsed_ticks as f64,
            tsc_origin: tsc_before,
            ns_origin: ns_before,
        }))
    }

    /// Current monotonic timestamp, in nanoseconds. Wait-free.
    pub fn now_ns(&self) -> u64 {
        match self.source {
            #[cfg(target_arch = "x86_64")]
            ClockSource::InvariantTsc => {
                let ticks = read_tsc().wrapping_sub(self.tsc_origin);
                self.ns_origin + (ticks as f64 * self.tsc_ns_per_tick) as u64
            }
            #[cfg(not(target_arch = "x86_64"))]
            ClockSource::InvariantTsc => unreachable!("TSC source is never selected on this architecture"),
            ClockSource::MonotonicRaw => clock_gettime_ns(libc::CLOCK_MONOTONIC_RAW).unwrap_or(self.ns_origin),
            ClockSource::Monotonic => clock_gettime_ns(libc::CLOCK_MONOTONIC).unwrap_or(self.ns_origin),
        }
    }

    /// Nominal resolution of the underlying source, in nanoseconds.
    pub fn resolution_ns(&self) -> u64 {
        match self.source {
            ClockSource::InvariantTsc => self.tsc_ns_per_tick.ceil().max(1.0) as u64,
            ClockSource::MonotonicRaw | ClockSource::Monotonic => 1,
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }
}

/// Process-wide shared timer, lazily probed on first use.
static SHARED: OnceLock<PrecisionTimer> = OnceLock::new();

/// Returns the process-wide timer, probing it on first call.
///
/// # Panics
/// Panics if no monotonic clock source exists at all; per spec.md §4.A,
/// clock non-monotonicity (or its complete absence) is a fatal error and
/// this crate never silently falls back to a non-monotonic wall clock.
pub fn shared() -> &'static PrecisionTimer {
    SHARED.get_or_init(|| PrecisionTimer::probe().expect("no monotonic clock source available"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_succeeds_and_is_monotonic() {
        let timer = PrecisionTimer::probe().expect("probe should succeed on any sane host");
        let a = timer.now_ns();
        let b = timer.now_ns();
        assert!(b >= a, "timer went backwards: {a} -> {b}");
    }

    #[test]
    fn now_ns_strictly_advances_over_a_sleep() {
        let timer = PrecisionTimer::probe().unwrap();
        let a = timer.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = timer.now_ns();
        assert!(b > a);
    }

    #[test]
    fn resolution_is_nonzero() {
        let timer = PrecisionTimer::probe().unwrap();
        assert!(timer.resolution_ns() >= 1);
    }
}
