//! # Memory access primitives
//!
//! The handful of per-architecture instructions the kernels are built from: full-line vector
//! stores, hardware line zeroing, vector loads kept live past the optimizer, and software
//! prefetch. Kernels are generic over [`AccessPrimitives`], [`Native`] picks the best set for the
//! target and [`Portable`] is a volatile-access fallback that runs everywhere.
use std::hint::black_box;
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence};

/// Bytes per cache line cell
pub const CACHE_LINE_SIZE: usize = 128;

/// 16-byte lanes per cache line cell
pub const LANES: usize = CACHE_LINE_SIZE / 16;

/// Value every lane of a written line holds
pub const WRITE_PATTERN: [f32; 4] = [1.0, 2.0, 3.0, 4.0];

/// Working sets up to this size are expected to stay in L1
pub const L1_RESIDENT_LIMIT: usize = 32 * 1024;

/// Prefetch distance, in lines, when data comes from L2
pub const L1_PREFETCH_DISTANCE: usize = 4;

/// Prefetch distance, in lines, when data comes from beyond L2
pub const L2_PREFETCH_DISTANCE: usize = 64;

/// One cache line, viewed either as eight 16-byte vector lanes or as eight 64-bit slots (the
/// first word of every lane). Slot 0 holds the next index for pointer chasing.
#[repr(C, align(128))]
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLine {
    lanes: [[u64; 2]; LANES],
}

impl CacheLine {
    /// Address of 64-bit slot `slot` (0..8) of the line at `line`
    ///
    /// # Safety
    /// `line` must point into a mapping at least one cache line long.
    #[inline(always)]
    pub unsafe fn slot(line: *mut CacheLine, slot: usize) -> *mut u64 {
        debug_assert!(slot < LANES);
        // SAFETY: caller guarantees `line` is in bounds; each lane is 2 words wide.
        unsafe { line.cast::<u64>().add(slot * 2) }
    }
}

const _: () = assert!(std::mem::size_of::<CacheLine>() == CACHE_LINE_SIZE);

/// Cache level a prefetch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
}

/// How far ahead the read kernel prefetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchTier {
    /// Working set fits in L1
    None,
    /// Working set fits in L2: prefetch into L1 [`L1_PREFETCH_DISTANCE`] lines ahead
    L1,
    /// Working set spills L2: also prefetch into L2 [`L2_PREFETCH_DISTANCE`] lines ahead
    L1L2,
}

impl PrefetchTier {
    /// Pick the tier from the per-thread working set and the per-thread L2 capacity
    pub fn for_working_set(bytes: usize, l2_capacity: usize) -> Self {
        if bytes <= L1_RESIDENT_LIMIT {
            PrefetchTier::None
        } else if bytes <= l2_capacity {
            PrefetchTier::L1
        } else {
            PrefetchTier::L1L2
        }
    }
}

/// Per-architecture memory access instructions
///
/// All functions take raw line pointers; callers guarantee the lines are mapped and 128-byte
/// aligned. Prefetch addresses may point past the mapping, prefetches never fault.
pub trait AccessPrimitives: Send + Sync + 'static {
    /// Store [`WRITE_PATTERN`] into all eight lanes
    ///
    /// # Safety
    /// `line` must be a valid, writable, aligned cache line.
    unsafe fn store_line(line: *mut CacheLine);

    /// Zero the whole line, avoiding a read-for-ownership where the hardware allows it
    ///
    /// # Safety
    /// `line` must be a valid, writable, aligned cache line.
    unsafe fn zero_line(line: *mut CacheLine);

    /// Order all zeroing stores issued so far
    fn zero_fence() {}

    /// Load all eight lanes and keep the values live
    ///
    /// # Safety
    /// `line` must be a valid, readable, aligned cache line.
    unsafe fn load_line(line: *const CacheLine);

    /// Hint that `line` will be read soon
    fn prefetch(line: *const CacheLine, level: CacheLevel);

    /// Compiler barrier: the memory behind `line` has been touched and may not be elided
    fn touched(line: *const CacheLine);
}

/// Volatile-access primitives usable on any target
#[derive(Debug, Default, Clone, Copy)]
pub struct Portable;

impl AccessPrimitives for Portable {
    #[inline(always)]
    unsafe fn store_line(line: *mut CacheLine) {
        let lanes = line.cast::<[f32; 4]>();
        for lane in 0..LANES {
            // SAFETY: caller guarantees the line is valid; lane < LANES.
            unsafe { ptr::write_volatile(lanes.add(lane), WRITE_PATTERN) };
        }
    }

    #[inline(always)]
    unsafe fn zero_line(line: *mut CacheLine) {
        let lanes = line.cast::<[u64; 2]>();
        for lane in 0..LANES {
            // SAFETY: caller guarantees the line is valid; lane < LANES.
            unsafe { ptr::write_volatile(lanes.add(lane), [0; 2]) };
        }
    }

    #[inline(always)]
    unsafe fn load_line(line: *const CacheLine) {
        let lanes = line.cast::<[u64; 2]>();
        let mut tab = [[0u64; 2]; LANES];
        for (lane, slot) in tab.iter_mut().enumerate() {
            // SAFETY: caller guarantees the line is valid; lane < LANES.
            *slot = unsafe { ptr::read_volatile(lanes.add(lane)) };
        }
        black_box(tab);
    }

    #[inline(always)]
    fn prefetch(_line: *const CacheLine, _level: CacheLevel) {}

    #[inline(always)]
    fn touched(line: *const CacheLine) {
        black_box(line);
        compiler_fence(Ordering::SeqCst);
    }
}

/// Eight no-op instructions, the body of one baseline step
#[inline(always)]
pub fn nop8() {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    // SAFETY: no-ops.
    unsafe {
        std::arch::asm!(
            "nop", "nop", "nop", "nop", "nop", "nop", "nop", "nop",
            options(nomem, nostack, preserves_flags),
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    compiler_fence(Ordering::SeqCst);
}

/// Force `value` into a register so the loads producing it stay in the loop
#[inline(always)]
pub fn keep_live(value: u64) {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    // SAFETY: empty asm reading one register.
    unsafe {
        std::arch::asm!("/* {0} */", in(reg) value, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    black_box(value);
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::{AccessPrimitives, CacheLevel, CacheLine, WRITE_PATTERN};
    use std::arch::x86_64::*;

    /// SSE primitives; line zeroing uses non-temporal stores
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Native;

    impl AccessPrimitives for Native {
        #[inline(always)]
        unsafe fn store_line(line: *mut CacheLine) {
            let p = line.cast::<f32>();
            // SAFETY: SSE is part of the x86_64 baseline; the line is 128-byte aligned.
            unsafe {
                let tab = _mm_loadu_ps(WRITE_PATTERN.as_ptr());
                _mm_store_ps(p, tab);
                _mm_store_ps(p.add(4), tab);
                _mm_store_ps(p.add(8), tab);
                _mm_store_ps(p.add(12), tab);
                _mm_store_ps(p.add(16), tab);
                _mm_store_ps(p.add(20), tab);
                _mm_store_ps(p.add(24), tab);
                _mm_store_ps(p.add(28), tab);
            }
        }

        #[inline(always)]
        unsafe fn zero_line(line: *mut CacheLine) {
            let p = line.cast::<__m128i>();
            // SAFETY: SSE2 is part of the x86_64 baseline; the line is 128-byte aligned.
            unsafe {
                let zero = _mm_setzero_si128();
                for lane in 0..super::LANES {
                    _mm_stream_si128(p.add(lane), zero);
                }
            }
        }

        #[inline(always)]
        fn zero_fence() {
            // SAFETY: sfence has no preconditions.
            unsafe { _mm_sfence() };
        }

        #[inline(always)]
        unsafe fn load_line(line: *const CacheLine) {
            let p = line.cast::<f32>();
            // SAFETY: SSE is part of the x86_64 baseline; the line is 128-byte aligned. The empty
            // asm consumes the registers so the loads cannot be dropped.
            unsafe {
                let t0 = _mm_load_ps(p);
                let t1 = _mm_load_ps(p.add(4));
                let t2 = _mm_load_ps(p.add(8));
                let t3 = _mm_load_ps(p.add(12));
                let t4 = _mm_load_ps(p.add(16));
                let t5 = _mm_load_ps(p.add(20));
                let t6 = _mm_load_ps(p.add(24));
                let t7 = _mm_load_ps(p.add(28));
                std::arch::asm!(
                    "/* {0} {1} {2} {3} {4} {5} {6} {7} */",
                    in(xmm_reg) t0, in(xmm_reg) t1, in(xmm_reg) t2, in(xmm_reg) t3,
                    in(xmm_reg) t4, in(xmm_reg) t5, in(xmm_reg) t6, in(xmm_reg) t7,
                    options(nomem, nostack, preserves_flags),
                );
            }
        }

        #[inline(always)]
        fn prefetch(line: *const CacheLine, level: CacheLevel) {
            let p = line.cast::<i8>();
            // SAFETY: prefetch is a hint and never faults, whatever the address.
            unsafe {
                match level {
                    CacheLevel::L1 => _mm_prefetch::<_MM_HINT_T0>(p),
                    CacheLevel::L2 => _mm_prefetch::<_MM_HINT_T1>(p),
                }
            }
        }

        #[inline(always)]
        fn touched(line: *const CacheLine) {
            // SAFETY: empty asm; without `nomem` it acts as a memory clobber.
            unsafe {
                std::arch::asm!("/* {0} */", in(reg) line, options(nostack, preserves_flags));
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::{AccessPrimitives, CACHE_LINE_SIZE, CacheLevel, CacheLine, Portable, WRITE_PATTERN};
    use std::arch::aarch64::*;
    use std::sync::OnceLock;

    /// NEON primitives; line zeroing uses `dc zva`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Native;

    /// Bytes zeroed by one `dc zva`, `None` when the instruction is prohibited
    fn zva_block() -> Option<usize> {
        static BLOCK: OnceLock<Option<usize>> = OnceLock::new();
        *BLOCK.get_or_init(|| {
            let dczid: u64;
            // SAFETY: DCZID_EL0 is readable at EL0.
            unsafe {
                std::arch::asm!(
                    "mrs {0}, dczid_el0",
                    out(reg) dczid,
                    options(nomem, nostack, preserves_flags),
                );
            }
            if dczid & 0x10 != 0 {
                None
            } else {
                Some(4 << (dczid & 0xf))
            }
        })
    }

    impl AccessPrimitives for Native {
        #[inline(always)]
        unsafe fn store_line(line: *mut CacheLine) {
            let p = line.cast::<f32>();
            // SAFETY: NEON is part of the aarch64 baseline; the line is valid and aligned.
            unsafe {
                let tab = vld1q_f32(WRITE_PATTERN.as_ptr());
                vst1q_f32(p, tab);
                vst1q_f32(p.add(4), tab);
                vst1q_f32(p.add(8), tab);
                vst1q_f32(p.add(12), tab);
                vst1q_f32(p.add(16), tab);
                vst1q_f32(p.add(20), tab);
                vst1q_f32(p.add(24), tab);
                vst1q_f32(p.add(28), tab);
            }
        }

        #[inline(always)]
        unsafe fn zero_line(line: *mut CacheLine) {
            match zva_block() {
                Some(block) if block <= CACHE_LINE_SIZE => {
                    let p = line.cast::<u8>();
                    for offset in (0..CACHE_LINE_SIZE).step_by(block) {
                        // SAFETY: the line is valid and aligned to at least `block`.
                        unsafe {
                            std::arch::asm!(
                                "dc zva, {0}",
                                in(reg) p.add(offset),
                                options(nostack, preserves_flags),
                            );
                        }
                    }
                }
                // SAFETY: forwarded caller guarantee.
                _ => unsafe { Portable::zero_line(line) },
            }
        }

        #[inline(always)]
        unsafe fn load_line(line: *const CacheLine) {
            let p = line.cast::<f32>();
            // SAFETY: NEON is part of the aarch64 baseline; the line is valid. The empty asm
            // consumes the registers so the loads cannot be dropped.
            unsafe {
                let t0 = vld1q_f32(p);
                let t1 = vld1q_f32(p.add(4));
                let t2 = vld1q_f32(p.add(8));
                let t3 = vld1q_f32(p.add(12));
                let t4 = vld1q_f32(p.add(16));
                let t5 = vld1q_f32(p.add(20));
                let t6 = vld1q_f32(p.add(24));
                let t7 = vld1q_f32(p.add(28));
                std::arch::asm!(
                    "/* {0:v} {1:v} {2:v} {3:v} {4:v} {5:v} {6:v} {7:v} */",
                    in(vreg) t0, in(vreg) t1, in(vreg) t2, in(vreg) t3,
                    in(vreg) t4, in(vreg) t5, in(vreg) t6, in(vreg) t7,
                    options(nomem, nostack, preserves_flags),
                );
            }
        }

        #[inline(always)]
        fn prefetch(line: *const CacheLine, level: CacheLevel) {
            // SAFETY: prfm is a hint and never faults, whatever the address.
            unsafe {
                match level {
                    CacheLevel::L1 => std::arch::asm!(
                        "prfm pldl1keep, [{0}]",
                        in(reg) line,
                        options(nostack, preserves_flags, readonly),
                    ),
                    CacheLevel::L2 => std::arch::asm!(
                        "prfm pldl2keep, [{0}]",
                        in(reg) line,
                        options(nostack, preserves_flags, readonly),
                    ),
                }
            }
        }

        #[inline(always)]
        fn touched(line: *const CacheLine) {
            // SAFETY: empty asm; without `nomem` it acts as a memory clobber.
            unsafe {
                std::arch::asm!("/* {0} */", in(reg) line, options(nostack, preserves_flags));
            }
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use arch::Native;

/// Best primitive set for the target
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type Native = Portable;

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes_f32(line: &CacheLine) -> [[f32; 4]; LANES] {
        // SAFETY: CacheLine is 128 plain bytes.
        unsafe { std::mem::transmute(*line) }
    }

    fn check_primitives<P: AccessPrimitives>() {
        let mut lines = vec![CacheLine::default(); 4];
        let base = lines.as_mut_ptr();

        for i in 0..4 {
            unsafe { P::store_line(base.add(i)) };
            P::touched(base.wrapping_add(i));
        }
        assert!(lines.iter().all(|l| lanes_f32(l) == [WRITE_PATTERN; LANES]));

        unsafe { P::load_line(base.add(1)) };
        P::prefetch(base.wrapping_add(1000), CacheLevel::L1);
        P::prefetch(base.wrapping_add(1000), CacheLevel::L2);

        let base = lines.as_mut_ptr();
        unsafe { P::zero_line(base.add(2)) };
        P::zero_fence();
        assert_eq!(lanes_f32(&lines[2]), [[0.0; 4]; LANES]);
        assert_eq!(lanes_f32(&lines[3]), [WRITE_PATTERN; LANES]);
    }

    #[test]
    fn portable_primitives_fill_and_clear() {
        check_primitives::<Portable>();
    }

    #[test]
    fn native_primitives_fill_and_clear() {
        check_primitives::<Native>();
    }

    #[test]
    fn slot_addresses_first_word_of_each_lane() {
        let mut line = CacheLine::default();
        let p: *mut CacheLine = &mut line;
        for slot in 0..LANES {
            unsafe { *CacheLine::slot(p, slot) = slot as u64 + 1 };
        }
        assert_eq!(line.lanes[3], [4, 0]);
        assert_eq!(line.lanes[7], [8, 0]);
    }

    #[test]
    fn prefetch_tier_follows_cache_capacity() {
        let l2 = 8 << 20;
        assert_eq!(PrefetchTier::for_working_set(16 << 10, l2), PrefetchTier::None);
        assert_eq!(PrefetchTier::for_working_set(32 << 10, l2), PrefetchTier::None);
        assert_eq!(PrefetchTier::for_working_set(64 << 10, l2), PrefetchTier::L1);
        assert_eq!(PrefetchTier::for_working_set(8 << 20, l2), PrefetchTier::L1);
        assert_eq!(PrefetchTier::for_working_set(16 << 20, l2), PrefetchTier::L1L2);
    }
}
