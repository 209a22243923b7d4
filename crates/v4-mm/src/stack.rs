//! Conservative native stack scanning
//!
//! Everything in here reads raw stack memory and is platform specific. The
//! manager only calls into it when the `conservative-stack` feature is
//! compiled in and [`StackScanMode::Conservative`](crate::StackScanMode) is
//! selected.

use std::mem::size_of;

/// Extent of the current thread's stack. The stack grows down from `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address (exclusive)
    pub origin: usize,
    /// Lowest mapped address
    pub limit: usize,
}

impl StackBounds {
    /// Query the bounds of the calling thread's stack.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn current_thread() -> Option<Self> {
        // SAFETY: attr is initialised by pthread_getattr_np before any read
        // and destroyed before returning
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let mut addr: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 || addr.is_null() {
                return None;
            }
            let limit = addr as usize;
            Some(Self {
                origin: limit + size,
                limit,
            })
        }
    }

    /// Query the bounds of the calling thread's stack.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub fn current_thread() -> Option<Self> {
        // SAFETY: both calls only inspect the calling thread
        unsafe {
            let thread = libc::pthread_self();
            let origin = libc::pthread_get_stackaddr_np(thread) as usize;
            let size = libc::pthread_get_stacksize_np(thread);
            (origin != 0).then(|| Self {
                origin,
                limit: origin - size,
            })
        }
    }

    /// Query the bounds of the calling thread's stack.
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    pub fn current_thread() -> Option<Self> {
        None
    }
}

/// Approximate the current stack pointer with the address of a local.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as usize
}

/// Visit every aligned machine word in `[from, to)`.
///
/// # Safety
/// The whole range must be mapped, readable memory, normally the live part
/// of the calling thread's stack.
#[inline(never)]
pub unsafe fn scan_words(from: usize, to: usize, visit: &mut dyn FnMut(u64)) {
    let align = size_of::<usize>();
    let mut cursor = from.next_multiple_of(align);
    while cursor + align <= to {
        // SAFETY: cursor is aligned and inside the caller-guaranteed range
        let word = unsafe { std::ptr::read_volatile(cursor as *const usize) };
        visit(word as u64);
        cursor += align;
    }
}

/// Callee-saved registers captured by [`spill_callee_saved`].
#[cfg(target_arch = "x86_64")]
pub const CALLEE_SAVED: usize = 6;
/// Callee-saved registers captured by [`spill_callee_saved`].
#[cfg(target_arch = "aarch64")]
pub const CALLEE_SAVED: usize = 11;
/// Callee-saved registers captured by [`spill_callee_saved`].
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CALLEE_SAVED: usize = 0;

/// Copy the callee-saved registers into memory.
///
/// A value the mutator keeps only in one of these registers across an
/// allocation is invisible to a plain stack walk.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn spill_callee_saved() -> [usize; CALLEE_SAVED] {
    let mut regs = [0usize; CALLEE_SAVED];
    // SAFETY: writes six words into `regs`, which has room for exactly six
    unsafe {
        std::arch::asm!(
            "mov [{out}], rbx",
            "mov [{out} + 8], rbp",
            "mov [{out} + 16], r12",
            "mov [{out} + 24], r13",
            "mov [{out} + 32], r14",
            "mov [{out} + 40], r15",
            out = in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    regs
}

/// Copy the callee-saved registers into memory.
///
/// A value the mutator keeps only in one of these registers across an
/// allocation is invisible to a plain stack walk.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn spill_callee_saved() -> [usize; CALLEE_SAVED] {
    let mut regs = [0usize; CALLEE_SAVED];
    // SAFETY: writes eleven words into `regs`, which has room for exactly eleven
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{out}]",
            "stp x21, x22, [{out}, #16]",
            "stp x23, x24, [{out}, #32]",
            "stp x25, x26, [{out}, #48]",
            "stp x27, x28, [{out}, #64]",
            "str x29, [{out}, #80]",
            out = in(reg) regs.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    regs
}

/// Copy the callee-saved registers into memory.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn spill_callee_saved() -> [usize; CALLEE_SAVED] {
    []
}

/// Scan the callee-saved registers and then the live part of the current
/// thread's stack, from the current stack pointer up to its origin. Returns
/// the number of words visited, or `None` when the stack bounds are unknown
/// on this platform.
#[inline(never)]
pub fn scan_current_stack(visit: &mut dyn FnMut(u64)) -> Option<usize> {
    let registers = spill_callee_saved();
    let words = scan_with_registers(&registers, visit);
    std::hint::black_box(&registers);
    words
}

/// Visit `registers`, then every word from this frame up to the stack origin.
#[inline(never)]
fn scan_with_registers(registers: &[usize], visit: &mut dyn FnMut(u64)) -> Option<usize> {
    let bounds = StackBounds::current_thread()?;
    let sp = approximate_stack_pointer();
    if sp < bounds.limit || sp >= bounds.origin {
        return None;
    }

    for &word in registers {
        visit(word as u64);
    }
    let mut words = registers.len();
    // SAFETY: [sp, origin) is the live, mapped portion of this thread's stack
    unsafe {
        scan_words(sp, bounds.origin, &mut |word| {
            words += 1;
            visit(word);
        });
    }
    Some(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_words_over_buffer() {
        let buffer: [usize; 4] = [1, 2, 3, 4];
        let start = buffer.as_ptr() as usize;
        let mut seen = Vec::new();
        unsafe { scan_words(start, start + 4 * size_of::<usize>(), &mut |w| seen.push(w)) };
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_stack_pointer_within_bounds() {
        let bounds = StackBounds::current_thread().expect("stack bounds");
        let sp = approximate_stack_pointer();
        assert!(bounds.limit < sp && sp < bounds.origin);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_register_words_are_visited_first() {
        let needle: usize = 0x7ffb_0000_0bad_f00d;
        let mut seen = Vec::new();
        let words = scan_with_registers(&[needle, 1], &mut |w| seen.push(w)).expect("scan");
        assert_eq!(&seen[..2], &[needle as u64, 1]);
        assert_eq!(words, seen.len());
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_scan_includes_spilled_registers() {
        let mut count = 0;
        let words = scan_current_stack(&mut |_| count += 1).expect("scan");
        assert_eq!(words, count);
        assert!(words > CALLEE_SAVED);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_scan_finds_local_word() {
        let needle: u64 = 0x7ffb_0000_dead_bee0;
        let slot = std::hint::black_box(&needle);
        let mut found = false;
        scan_current_stack(&mut |word| found |= word == needle).expect("scan");
        std::hint::black_box(slot);
        assert!(found);
    }
}
