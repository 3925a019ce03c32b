//! Clocks, Timers and CPU Affinity
//!
//! The engine reads time through the [`Clock`] trait so the staged loop can be
//! driven by [`FakeClock`] in tests. [`SystemClock`] is the monotonic wall
//! clock used in measured children.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond time source
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;

    /// Smallest observable non-zero step of this clock, in nanoseconds.
    fn resolution_ns(&self) -> u64;
}

/// Process-wide monotonic clock backed by `std::time::Instant`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

fn origin() -> std::time::Instant {
    static ORIGIN: OnceLock<std::time::Instant> = OnceLock::new();
    *ORIGIN.get_or_init(std::time::Instant::now)
}

impl Clock for SystemClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        origin().elapsed().as_nanos() as u64
    }

    fn resolution_ns(&self) -> u64 {
        static RESOLUTION: OnceLock<u64> = OnceLock::new();
        *RESOLUTION.get_or_init(|| probe_resolution(self))
    }
}

/// Smallest non-zero delta between consecutive reads, over a bounded number of probes.
fn probe_resolution(clock: &dyn Clock) -> u64 {
    const PROBES: usize = 256;
    const MAX_SPINS: usize = 100_000;

    let mut best = u64::MAX;
    for _ in 0..PROBES {
        let start = clock.now_ns();
        for _ in 0..MAX_SPINS {
            let now = clock.now_ns();
            if now != start {
                best = best.min(now - start);
                break;
            }
        }
    }
    if best == u64::MAX { 1 } else { best.max(1) }
}

/// Clock that only moves when told to
///
/// Clones share the same time, so a test workload can advance the clock the
/// engine is reading.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<AtomicU64>,
    resolution: u64,
}

impl FakeClock {
    /// New clock at time zero with a 1 ns resolution.
    pub fn new() -> Self {
        Self::with_resolution(1)
    }

    /// New clock at time zero reporting the given resolution.
    pub fn with_resolution(resolution_ns: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            resolution: resolution_ns.max(1),
        }
    }

    /// Move time forward.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn resolution_ns(&self) -> u64 {
        self.resolution
    }
}

/// Measures one unit against a [`Clock`]
pub struct Timer<'c, C: Clock + ?Sized> {
    clock: &'c C,
    start: u64,
}

impl<'c, C: Clock + ?Sized> Timer<'c, C> {
    /// Start timing now.
    #[inline(always)]
    pub fn start(clock: &'c C) -> Self {
        Self {
            start: clock.now_ns(),
            clock,
        }
    }

    /// Nanoseconds since [`Timer::start`].
    #[inline(always)]
    pub fn stop(&self) -> u64 {
        self.clock.now_ns().saturating_sub(self.start)
    }
}

/// Restores the previous CPU affinity of the current thread when dropped
pub struct AffinityGuard {
    #[cfg(target_os = "linux")]
    previous: Option<libc::cpu_set_t>,
}

/// Pin the current thread to the CPUs in `mask` (bit `n` = CPU `n`).
///
/// The returned guard restores the previous mask. On platforms without
/// affinity support this is a no-op.
#[cfg(target_os = "linux")]
pub fn pin_to_mask(mask: u64) -> Result<AffinityGuard, std::io::Error> {
    if mask == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "affinity mask selects no CPU",
        ));
    }

    // SAFETY: cpu_set_t is plain data; the kernel fills it on success.
    unsafe {
        let mut previous: libc::cpu_set_t = std::mem::zeroed();
        let size = std::mem::size_of::<libc::cpu_set_t>();
        let saved = libc::sched_getaffinity(0, size, &mut previous) == 0;

        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..64usize {
            if mask & (1 << cpu) != 0 {
                libc::CPU_SET(cpu, &mut set);
            }
        }

        if libc::sched_setaffinity(0, size, &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(AffinityGuard {
            previous: saved.then_some(previous),
        })
    }
}

/// Affinity is not supported on this platform; always succeeds.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_mask(_mask: u64) -> Result<AffinityGuard, std::io::Error> {
    Ok(AffinityGuard {})
}

/// Pin the current thread to a single CPU.
pub fn pin_to_cpu(cpu: usize) -> Result<AffinityGuard, std::io::Error> {
    if cpu >= 64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cpu index {} outside the 64-bit affinity mask", cpu),
        ));
    }
    pin_to_mask(1 << cpu)
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Some(previous) = self.previous.take() {
            // SAFETY: restoring a mask previously returned by the kernel.
            unsafe {
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &previous);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_ns();
        assert!(b >= a + 1_000_000);
    }

    #[test]
    fn test_system_clock_resolution_is_positive() {
        let resolution = SystemClock.resolution_ns();
        assert!(resolution >= 1);
        // Any usable monotonic clock resolves better than a millisecond
        assert!(resolution < 1_000_000);
    }

    #[test]
    fn test_fake_clock_shared_between_clones() {
        let clock = FakeClock::new();
        let handle = clock.clone();
        let timer = Timer::start(&clock);
        handle.advance(250);
        assert_eq!(timer.stop(), 250);
    }

    #[test]
    fn test_probe_on_fake_clock_terminates() {
        // A clock that never moves must not hang the probe
        assert_eq!(probe_resolution(&FakeClock::new()), 1);
    }

    #[test]
    fn test_empty_mask_rejected() {
        if cfg!(target_os = "linux") {
            assert!(pin_to_mask(0).is_err());
        }
    }

    #[test]
    fn test_pin_to_cpu_zero() {
        // CPU 0 may be excluded by a container cpuset; only check the guard path
        if let Ok(guard) = pin_to_cpu(0) {
            drop(guard);
        }
        assert!(pin_to_cpu(64).is_err());
    }
}
