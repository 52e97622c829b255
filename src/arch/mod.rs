//! # Architecture Abstraction Layer
//!
//! Provides the hardware abstraction boundary for the scheduler. The
//! scheduler core is generic over [`Context`] and never touches a register
//! layout; each target supplies one implementation, picked at build time:
//!
//! - `thumbv7em-none-*`: [`cortex_m4::CortexM4`] (PendSV-based switch)
//! - everything else: [`sim::Simulated`], a host port that keeps the same
//!   stack-pointer bookkeeping so the scheduler can be unit tested.

use crate::thread::{ThreadEntry, ThreadReturn};

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
pub mod sim;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::CortexM4 as DefaultContext;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use sim::Simulated as DefaultContext;

/// Save/restore of execution context for one CPU architecture.
///
/// A switch happens in two halves. [`Context::request_switch`] starts it:
/// a port that can switch synchronously saves the outgoing registers right
/// away and returns the resulting stack pointer; a port that switches from
/// an exception handler (PendSV) only pends that exception and returns
/// `None`. Either way the scheduler's `switch_stacks` is then called with
/// the saved pointer and hands back the stack pointer to restore, which
/// the port loads in [`Context::resume`] (or in its handler).
pub trait Context {
    /// Bytes a switched-out thread's saved registers take on its stack.
    const FRAME_SIZE: usize;

    /// Build the first frame of a thread that has never run, so that the
    /// first restore looks like a call to `entry(arg)` that returns into
    /// `on_return`. Returns the initial stack pointer.
    fn initial_context(
        stack: &mut [u8],
        entry: ThreadEntry,
        arg: usize,
        on_return: ThreadReturn,
    ) -> usize;

    /// Start a context switch. Returns the outgoing thread's saved stack
    /// pointer if the save happened synchronously.
    fn request_switch(&mut self) -> Option<usize>;

    /// Complete a synchronous switch by restoring from `sp`.
    fn resume(&mut self, sp: usize);
}
