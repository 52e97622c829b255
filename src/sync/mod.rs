//! # Synchronization Primitives
//!
//! Blocking primitives built on the scheduler: a hand-off [`Mutex`] and
//! synchronous message passing ([`msg`]). Both operate on a
//! `&mut Scheduler`, so they are only reachable inside the kernel critical
//! section (see [`crate::irq`]).

pub mod msg;
pub mod mutex;

pub use msg::Msg;
pub use mutex::Mutex;
