//! Sampling decision and stack capture for allocation events.

use crate::buffer::{GLOBAL_BUFFER, MAX_STACK_DEPTH};
use core::cell::Cell;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// How the hook decides which allocations to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Sample an allocation of `size` bytes with probability `min(1, size / rate)`
    ByteInterval,
    /// Sample every `rate`-th allocation regardless of size
    FixedRatio,
}

impl SampleMode {
    const fn to_raw(self) -> u8 {
        match self {
            SampleMode::ByteInterval => 0,
            SampleMode::FixedRatio => 1,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SampleMode::FixedRatio,
            _ => SampleMode::ByteInterval,
        }
    }
}

/// Active sampling rate (0 = sampling disabled)
static RATE: AtomicU64 = AtomicU64::new(0);
static MODE: AtomicU8 = AtomicU8::new(0);
/// Allocation counter for fixed-ratio sampling
static CALLS: AtomicU64 = AtomicU64::new(0);
/// Seed source for per-thread generators
static SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
    static IGNORED: Cell<bool> = const { Cell::new(false) };
    static RNG: Cell<u64> = const { Cell::new(0) };
}

/// Configure sampling and return the previous rate.
///
/// A rate of zero disables sampling.
pub fn set_sampling(mode: SampleMode, rate: u64) -> u64 {
    MODE.store(mode.to_raw(), Ordering::Relaxed);
    CALLS.store(0, Ordering::Relaxed);
    RATE.swap(rate, Ordering::SeqCst)
}

/// Stop sampling allocations. Returns the previous rate.
pub fn disable_sampling() -> u64 {
    RATE.swap(0, Ordering::SeqCst)
}

/// Current (mode, rate) pair
pub fn sampling() -> (SampleMode, u64) {
    (
        SampleMode::from_raw(MODE.load(Ordering::Relaxed)),
        RATE.load(Ordering::Relaxed),
    )
}

/// Never sample allocations made by the calling thread.
///
/// The collector thread calls this so that its own bookkeeping does not show
/// up in the profile.
pub fn ignore_current_thread() {
    IGNORED.with(|ignored| ignored.set(true));
}

/// xorshift64* on a per-thread state
fn next_random() -> u64 {
    RNG.with(|rng| {
        let mut x = rng.get();
        if x == 0 {
            let local = 0u8;
            x = SEED.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed)
                ^ (&local as *const u8 as u64);
            x |= 1;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        rng.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    })
}

/// Decide whether an allocation of `size` bytes should be recorded.
pub fn should_sample(size: usize) -> bool {
    let rate = RATE.load(Ordering::Relaxed);
    if rate == 0 {
        return false;
    }
    match SampleMode::from_raw(MODE.load(Ordering::Relaxed)) {
        SampleMode::ByteInterval => {
            let size = size as u64;
            size >= rate || next_random() % rate < size
        }
        SampleMode::FixedRatio => CALLS.fetch_add(1, Ordering::Relaxed) % rate == 0,
    }
}

/// Marks the current thread as inside the hook for the guard's lifetime.
struct HookGuard;

impl HookGuard {
    fn enter() -> Option<Self> {
        if IGNORED.with(Cell::get) || IN_HOOK.with(|flag| flag.replace(true)) {
            return None;
        }
        Some(HookGuard)
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

/// Record an allocation of `size` bytes if it is selected for sampling.
#[inline(never)]
pub fn record_alloc(size: usize) {
    if RATE.load(Ordering::Relaxed) == 0 {
        return;
    }
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    if !should_sample(size) {
        return;
    }

    let mut stack = [0u64; MAX_STACK_DEPTH];
    let depth = capture_stack(&mut stack);
    GLOBAL_BUFFER.push(&stack[..depth], size);
}

#[cfg(target_arch = "x86_64")]
const MAX_USER_ADDR: usize = 0x7fff_ffff_ffff;
#[cfg(not(target_arch = "x86_64"))]
const MAX_USER_ADDR: usize = 0xffff_ffff_ffff;

/// Read the caller's frame pointer register
#[inline(always)]
fn frame_pointer() -> *const usize {
    let fp: *const usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "mov {}, rbp",
            out(reg) fp,
            options(nomem, nostack, preserves_flags)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "mov {}, x29",
            out(reg) fp,
            options(nomem, nostack, preserves_flags)
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        fp = core::ptr::null();
    }
    fp
}

/// Capture the current stack by walking frame pointers.
///
/// Requires code built with `-C force-frame-pointers=yes`; frames without a
/// frame pointer end the walk early.
#[inline(never)]
pub fn capture_stack(stack: &mut [u64; MAX_STACK_DEPTH]) -> usize {
    let mut fp = frame_pointer();
    let mut depth = 0;

    while !fp.is_null() && depth < MAX_STACK_DEPTH {
        if (fp as usize) & 0x7 != 0 {
            break;
        }
        if !(0x1000..=MAX_USER_ADDR).contains(&(fp as usize)) {
            break;
        }

        // Return address sits just above the saved frame pointer
        let ret_addr = unsafe { *fp.add(1) };
        if ret_addr == 0 {
            break;
        }
        stack[depth] = ret_addr as u64;
        depth += 1;

        let next_fp = unsafe { *fp as *const usize };
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }

    depth
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Sampling configuration is process-wide
    pub(crate) static CONFIG_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_disabled_never_samples() {
        let _lock = CONFIG_LOCK.lock().unwrap();
        disable_sampling();
        assert!(!should_sample(1 << 30));
    }

    #[test]
    fn test_large_allocations_always_sampled() {
        let _lock = CONFIG_LOCK.lock().unwrap();
        set_sampling(SampleMode::ByteInterval, 1024);
        for _ in 0..100 {
            assert!(should_sample(1024));
            assert!(should_sample(4096));
        }
        disable_sampling();
    }

    #[test]
    fn test_byte_interval_probability() {
        let _lock = CONFIG_LOCK.lock().unwrap();
        set_sampling(SampleMode::ByteInterval, 1000);
        let hits = (0..100_000).filter(|_| should_sample(100)).count();
        disable_sampling();
        // Expect about 10%
        assert!((8_000..12_000).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_fixed_ratio_every_nth() {
        let _lock = CONFIG_LOCK.lock().unwrap();
        set_sampling(SampleMode::FixedRatio, 4);
        let picks: Vec<bool> = (0..8).map(|_| should_sample(1)).collect();
        disable_sampling();
        assert_eq!(
            picks,
            [true, false, false, false, true, false, false, false]
        );
    }

    #[test]
    fn test_set_sampling_returns_previous() {
        let _lock = CONFIG_LOCK.lock().unwrap();
        set_sampling(SampleMode::FixedRatio, 7);
        assert_eq!(set_sampling(SampleMode::ByteInterval, 9), 7);
        assert_eq!(sampling(), (SampleMode::ByteInterval, 9));
        assert_eq!(disable_sampling(), 9);
    }
}
