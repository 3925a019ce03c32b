//! Instruction-Cache Clearing
//!
//! Before a measured unit the engine may ask a [`CacheClearingStrategy`] to
//! evict the process's code from the CPU caches, so every unit starts from
//! the same cold instruction-cache state.
//!
//! The native strategy walks the executable mappings of the process and
//! flushes them line by line (`clflush` on x86_64, `ic ivau` on AArch64).
//! Everywhere else the strategy is a no-op.
//!
//! # Caveat
//!
//! The no-op fallback trades measurement purity for portability: on those
//! platforms units that follow each other run with whatever cache state the
//! previous unit left behind, and results are not comparable with runs on a
//! platform that flushes. The selected strategy is reported by
//! [`CacheClearingStrategy::name`] and logged once per process.

use std::sync::{Once, OnceLock};

/// Normalizes instruction-cache state before a measured unit
pub trait CacheClearingStrategy: Send + Sync {
    /// Clear the instruction cache of the current process, optionally while
    /// pinned to the CPUs in `affinity` (bit `n` = CPU `n`).
    fn clear_cache(&self, affinity: Option<u64>);

    /// Short name for logs and records.
    fn name(&self) -> &'static str;

    /// Whether this strategy actually touches the caches.
    fn is_native(&self) -> bool;
}

/// Does nothing; used where no flush primitive exists
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCacheClearingStrategy;

impl CacheClearingStrategy for NoOpCacheClearingStrategy {
    fn clear_cache(&self, _affinity: Option<u64>) {}

    fn name(&self) -> &'static str {
        "no-op"
    }

    fn is_native(&self) -> bool {
        false
    }
}

/// Flushes every executable mapping of the process
#[derive(Debug, Clone, Copy)]
pub struct NativeCacheClearingStrategy {
    line_size: usize,
}

impl NativeCacheClearingStrategy {
    /// Probe for the native primitive; `None` when this platform has none.
    pub fn probe() -> Option<Self> {
        if !cfg!(all(
            target_os = "linux",
            any(target_arch = "x86_64", target_arch = "aarch64")
        )) {
            return None;
        }
        // The mapping list is our only way to find the code to flush
        if executable_regions().is_empty() {
            return None;
        }
        Some(Self {
            line_size: instruction_line_size(),
        })
    }
}

impl CacheClearingStrategy for NativeCacheClearingStrategy {
    fn clear_cache(&self, affinity: Option<u64>) {
        let _pinned = affinity.and_then(|mask| match crate::measure::pin_to_mask(mask) {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::debug!("could not pin to affinity mask {:#x}: {}", mask, e);
                None
            }
        });

        // Re-read the mappings every time: code can be unmapped between units
        for (start, end) in executable_regions() {
            let mut addr = start - start % self.line_size;
            while addr < end {
                flush_line(addr);
                addr += self.line_size;
            }
        }
        flush_barrier();
    }

    fn name(&self) -> &'static str {
        "native"
    }

    fn is_native(&self) -> bool {
        true
    }
}

/// Readable and executable regions of the current process, from `/proc/self/maps`.
fn executable_regions() -> Vec<(usize, usize)> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    parse_executable_regions(&maps)
}

fn parse_executable_regions(maps: &str) -> Vec<(usize, usize)> {
    maps.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let range = fields.next()?;
            let perms = fields.next()?;
            if !perms.starts_with("r-x") {
                return None;
            }
            // Kernel-provided pages are shared and not ours to flush
            if line.ends_with("[vsyscall]") || line.ends_with("[vdso]") || line.ends_with("[vvar]") {
                return None;
            }
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (end > start).then_some((start, end))
        })
        .collect()
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn instruction_line_size() -> usize {
    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux.
    unsafe {
        std::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nostack, nomem));
    }
    4 << (ctr & 0xf)
}

#[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
fn instruction_line_size() -> usize {
    64
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(always)]
fn flush_line(addr: usize) {
    // SAFETY: `addr` lies inside a readable mapping listed by the kernel.
    unsafe { std::arch::x86_64::_mm_clflush(addr as *const u8) }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[inline(always)]
fn flush_line(addr: usize) {
    // SAFETY: `addr` lies inside a readable mapping; Linux permits EL0 cache maintenance.
    unsafe { std::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack)) }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
#[inline(always)]
fn flush_line(_addr: usize) {}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(always)]
fn flush_barrier() {
    // SAFETY: fences have no memory-safety preconditions.
    unsafe { std::arch::x86_64::_mm_mfence() }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[inline(always)]
fn flush_barrier() {
    // SAFETY: barriers have no memory-safety preconditions.
    unsafe { std::arch::asm!("dsb ish", "isb", options(nostack)) }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
#[inline(always)]
fn flush_barrier() {}

/// Strategy chosen for this process by capability probing.
///
/// The first call probes; falling back to the no-op strategy is logged once.
pub fn select_cache_clearing_strategy() -> &'static dyn CacheClearingStrategy {
    static SELECTED: OnceLock<Box<dyn CacheClearingStrategy>> = OnceLock::new();
    static FALLBACK_LOGGED: Once = Once::new();

    let strategy = SELECTED.get_or_init(|| match NativeCacheClearingStrategy::probe() {
        Some(native) => Box::new(native),
        None => Box::new(NoOpCacheClearingStrategy),
    });

    if !strategy.is_native() {
        FALLBACK_LOGGED.call_once(|| {
            tracing::warn!(
                "instruction-cache flush unsupported on this platform; cache clearing is a no-op \
                 and consecutive units share cache state"
            );
        });
    }
    strategy.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a2b000 r--p 00000000 fd:01 1234 /usr/bin/bench
55d0c0a2b000-55d0c0b10000 r-xp 0002b000 fd:01 1234 /usr/bin/bench
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2d028000-7f1e2d1bd000 r-xp 00028000 fd:01 5678 /usr/lib/libc.so.6
7ffd5b5f2000-7ffd5b5f4000 r-xp 00000000 00:00 0 [vdso]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]";

    #[test]
    fn test_parse_keeps_readable_executable_regions() {
        let regions = parse_executable_regions(MAPS);
        assert_eq!(
            regions,
            vec![
                (0x55d0c0a2b000, 0x55d0c0b10000),
                (0x7f1e2d028000, 0x7f1e2d1bd000)
            ]
        );
    }

    #[test]
    fn test_noop_leaves_affinity_untouched() {
        #[cfg(target_os = "linux")]
        let before = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
            set
        };

        let strategy = NoOpCacheClearingStrategy;
        strategy.clear_cache(None);
        strategy.clear_cache(Some(0b1));
        assert!(!strategy.is_native());
        assert_eq!(strategy.name(), "no-op");

        #[cfg(target_os = "linux")]
        {
            let after = unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
                set
            };
            assert!(before == after);
        }
    }

    #[test]
    fn test_native_flush_completes() {
        if let Some(native) = NativeCacheClearingStrategy::probe() {
            native.clear_cache(None);
            assert!(native.is_native());
            assert!(native.line_size >= 4);
        }
    }

    #[test]
    fn test_selection_is_stable() {
        let first = select_cache_clearing_strategy();
        let second = select_cache_clearing_strategy();
        assert_eq!(first.name(), second.name());
        first.clear_cache(None);
    }
}
