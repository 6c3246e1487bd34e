// Instruction-level primitives shared by the recursion engine and the cache
// side channel. Everything here is a thin wrapper around one or two machine
// instructions; none of it allocates or touches the stack beyond its own
// frame.
//
use std::arch::asm;
use std::arch::x86_64::{_mm_clflush, _mm_mfence};

// x86 read-time-stamp-counter instruction access, returns a 64-bit CPU cycle
// timer, used for high-precision timing of cache hits and misses
#[inline(always)]
pub fn rdtscp() -> u64
{
    let eax: u32;
    let _ecx: u32;
    let edx: u32;
    unsafe {
    asm!(
      "rdtscp",
      lateout("eax") eax,
      lateout("ecx") _ecx,
      lateout("edx") edx,
      options(nomem, nostack)
    );
    }
    (edx as u64) << 32 | eax as u64
}

/// Full memory fence, orders the flushes before any following timed load.
#[inline(always)]
pub fn mfence()
{
    unsafe { _mm_mfence(); }
}

/// Evict the cache line holding `addr` from every level of the hierarchy.
#[inline(always)]
pub fn clflush(addr: *const u8)
{
    unsafe { _mm_clflush(addr); }
}

/// Read one byte in a way the compiler cannot elide. The value itself is
/// irrelevant, only the cache footprint of the load matters.
///
/// # Safety
///
/// `addr` must be valid for reads.
#[inline(always)]
pub unsafe fn force_read(addr: *const u8)
{
    std::hint::black_box(std::ptr::read_volatile(addr));
}

/// Give up the rest of the time slice so a co-scheduled process gets the core.
#[inline(always)]
pub fn yield_cpu()
{
    unsafe { libc::sched_yield(); }
}
