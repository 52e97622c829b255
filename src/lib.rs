//! # rtcore: Real-Time Kernel Core
//!
//! A fixed-priority preemptive RTOS kernel core for single-core
//! microcontrollers, with an ARM Cortex-M4 port.
//!
//! ## Overview
//!
//! The most urgent runnable thread always runs. Priority 0 is the most
//! urgent level; threads sharing a level run in FIFO order and rotate on
//! yield, on blocking, or (optionally) when a tick-driven time slice
//! expires. Threads block on mutexes, on message passing and on sleep,
//! and are readied by other threads or by interrupt handlers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                 │
//! │   init · thread_create · start · msg_* · mutex_*       │
//! ├──────────────────────────────┬─────────────────────────┤
//! │  Scheduler (scheduler.rs)    │  Sync (sync/)           │
//! │  ─ schedule() · ready()      │  ─ Mutex (hand-off)     │
//! │  ─ yield · sleep · tick      │  ─ msg send/receive     │
//! ├──────────────────────────────┴─────────────────────────┤
//! │  Run queue (runqueue.rs, list.rs)   IRQ (irq.rs)       │
//! │  per-priority FIFOs + bitmap        critical section   │
//! ├────────────────────────────────────────────────────────┤
//! │           Thread model (thread.rs): TCB table          │
//! ├────────────────────────────────────────────────────────┤
//! │  Context layer (arch/): Context trait                  │
//! │  cortex_m4 (PendSV, SysTick)  ·  sim (host)            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every TCB lives in a fixed `[Option<Tcb>; MAX_THREADS]`
//! - **Arena + index lists**: run queues, mutex waiters and blocked
//!   senders link TCBs by [`ThreadId`], never by pointer
//! - **Caller-owned stacks**: `&'static mut [u8]`, see [`static_stack!`]
//! - **One lock**: interrupts disabled around every kernel operation

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod irq;
pub mod kernel;
pub mod list;
pub mod runqueue;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use config::SchedulerConfig;
pub use error::{Fatal, KernelError, KernelResult};
pub use scheduler::Scheduler;
pub use sync::{Msg, Mutex};
pub use thread::{ThreadFlags, ThreadId, ThreadState};
