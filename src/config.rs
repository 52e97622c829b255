//! # rtcore Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All limits are fixed at compile time; there is no dynamic allocation.
//!
//! The two policy points that differ between targets (tick-driven round
//! robin and how an ISR-side wakeup reschedules) live in [`SchedulerConfig`],
//! whose defaults come from the constants below.

/// Maximum number of threads the system can manage simultaneously,
/// including the idle thread. Bounds the static TCB table.
pub const MAX_THREADS: usize = 16;

/// Number of priority levels. Level 0 is the most urgent. The run-queue
/// bitmap is a `u32`, so this may not exceed 32.
pub const PRIORITY_LEVELS: usize = 16;

/// Priority of the idle thread: always the least urgent level.
pub const IDLE_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;

/// Tick frequency in Hz. Sleep durations and time slices are in ticks.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Smallest stack a thread may be created with. Must hold the initial
/// context frame plus room for the entry function's first call.
pub const MIN_STACK_SIZE: usize = 256;

/// Stack size of the kernel-provided idle thread.
pub const IDLE_STACK_SIZE: usize = 512;

/// Upper bound on a thread's message queue (see `msg_init_queue`).
pub const MSG_QUEUE_CAPACITY: usize = 8;

/// Pattern written over the whole stack of `STACKTEST` threads. Words
/// still holding it were never touched.
pub const STACK_SENTINEL: usize = 0xDEAD_BEEF;

/// Time slice in ticks used when tick-driven round robin is enabled.
pub const DEFAULT_TIME_SLICE: u32 = 10;

const _: () = assert!(PRIORITY_LEVELS <= 32, "run-queue bitmap is a u32");
const _: () = assert!(MAX_THREADS <= u8::MAX as usize, "thread index is one byte of ThreadId");

/// Where a reschedule requested from interrupt context takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrReschedule {
    /// Flag the switch and perform it when the outermost ISR exits.
    Defer,
    /// Request the switch right away. Only sound on ports whose switch
    /// mechanism is itself an exception that cannot run mid-ISR (PendSV).
    Immediate,
}

/// Runtime scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// `Some(n)`: the tick rotates the running thread among its equal
    /// priority peers every `n` ticks. `None`: pure priority preemption.
    pub time_slice: Option<u32>,
    /// Reschedule policy for `ready()` calls made from an ISR.
    pub isr_reschedule: IsrReschedule,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            time_slice: None,
            isr_reschedule: IsrReschedule::Defer,
        }
    }

    /// Same as the default, with round robin among equal priorities.
    pub const fn round_robin(slice: u32) -> Self {
        Self {
            time_slice: Some(slice),
            isr_reschedule: IsrReschedule::Defer,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
