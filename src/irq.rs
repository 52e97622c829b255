//! # Interrupt Control
//!
//! The kernel's only lock: interrupts disabled. Every access to the
//! scheduler, its run queues and every TCB happens inside [`free`].
//!
//! Built on the `critical-section` crate. On the Cortex-M4 the
//! implementation comes from `cortex-m`'s `critical-section-single-core`
//! feature (`cpsid i` / restore PRIMASK); host builds link the `std`
//! implementation, which is a process-wide lock.

pub use critical_section::CriticalSection;
use critical_section::RestoreState;

/// Run `f` with interrupts disabled. Nests: the previous interrupt state
/// is restored on exit, not unconditionally re-enabled.
#[inline]
pub fn free<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Saved interrupt state returned by [`disable`].
#[must_use = "the state must be passed back to `restore`"]
pub struct IrqState(RestoreState);

/// Disable interrupts and return the previous state.
///
/// # Safety
/// Must be paired with exactly one [`restore`] of the returned state, in
/// reverse order of nesting.
#[inline]
pub unsafe fn disable() -> IrqState {
    IrqState(unsafe { critical_section::acquire() })
}

/// Restore the interrupt state saved by [`disable`].
///
/// # Safety
/// `state` must come from the matching, most recent [`disable`].
#[inline]
pub unsafe fn restore(state: IrqState) {
    unsafe { critical_section::release(state.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_returns_value_and_nests() {
        let v = free(|_| free(|_| 7) + 1);
        assert_eq!(v, 8);
    }

    #[test]
    fn test_disable_restore_pair() {
        let state = unsafe { disable() };
        let inner = free(|_| 3);
        unsafe { restore(state) };
        assert_eq!(inner, 3);
    }
}
