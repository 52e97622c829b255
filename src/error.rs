//! # Errors
//!
//! Two classes of failure exist in the kernel:
//!
//! - [`KernelError`]: recoverable. The kernel's own bookkeeping is intact
//!   and the caller decides what to do (retry, give up, log).
//! - [`Fatal`]: the kernel can no longer trust its state (corrupted stack,
//!   a mutex unlocked by a thread that does not own it, a stale thread id).
//!   These go through [`fatal`], which never returns.

use core::fmt;

use crate::thread::ThreadId;

/// Recoverable error returned by kernel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The thread table has no free slot.
    TableFull,
    /// Priority outside `0..PRIORITY_LEVELS`.
    InvalidPriority,
    /// No live thread has this id.
    NoSuchThread,
    /// The operation would have to block and was asked not to.
    WouldBlock,
    /// The thread is not in the state the operation expects.
    InvalidState,
    /// The thread being waited on exited before the operation completed.
    PeerExited,
    /// A thread tried to send a message to itself.
    SendToSelf,
    /// Blocking is not permitted in interrupt context.
    InInterrupt,
    /// An argument is outside what the kernel was configured for.
    InvalidArgument,
    /// The thread was readied out of a blocking call before it completed.
    Interrupted,
}

impl KernelError {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelError::TableFull => "thread table is full",
            KernelError::InvalidPriority => "priority out of range",
            KernelError::NoSuchThread => "no such thread",
            KernelError::WouldBlock => "operation would block",
            KernelError::InvalidState => "thread is in the wrong state",
            KernelError::PeerExited => "peer thread exited",
            KernelError::SendToSelf => "cannot send a message to self",
            KernelError::InInterrupt => "cannot block in interrupt context",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::Interrupted => "blocking call interrupted",
        }
    }

    /// Negative errno-style code for C-facing callers.
    pub fn errno(self) -> i32 {
        match self {
            KernelError::TableFull => -75,      // EOVERFLOW
            KernelError::InvalidPriority => -22, // EINVAL
            KernelError::NoSuchThread => -3,     // ESRCH
            KernelError::WouldBlock => -11,      // EAGAIN
            KernelError::InvalidState => -22,    // EINVAL
            KernelError::PeerExited => -32,      // EPIPE
            KernelError::SendToSelf => -35,      // EDEADLK
            KernelError::InInterrupt => -1,      // EPERM
            KernelError::InvalidArgument => -22, // EINVAL
            KernelError::Interrupted => -4,      // EINTR
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Unrecoverable kernel condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// `start()` found no thread at `IDLE_PRIORITY`.
    NoIdleThread,
    /// A stack cannot hold the initial context frame.
    StackTooSmall { size: usize },
    /// The saved stack pointer left the thread's stack, or the bottom
    /// sentinel of a `STACKTEST` thread was overwritten.
    StackOverflow { thread: ThreadId },
    /// A mutex was unlocked by a thread that does not own it.
    MutexNotOwned { caller: Option<ThreadId> },
    /// The owner of a mutex tried to lock it again.
    MutexRelock { thread: ThreadId },
    /// An id that does not name a live thread reached the scheduler core.
    StaleThread { thread: ThreadId },
    /// A TCB was installed in a slot that already holds a live thread.
    DuplicateThread { thread: ThreadId },
    /// A thread was readied while already queued or running.
    AlreadyReady { thread: ThreadId },
    /// A thread was readied while queued on a mutex.
    MutexWaiterReadied { thread: ThreadId },
    /// The idle thread tried to block, sleep or exit.
    IdleBlocked { thread: ThreadId },
    /// `thread_exit` was called from an interrupt handler.
    ExitInInterrupt,
    /// A scheduler call that needs a running thread was made before `start()`.
    NotStarted,
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::NoIdleThread => write!(f, "no idle thread"),
            Fatal::StackTooSmall { size } => write!(f, "stack of {} bytes too small", size),
            Fatal::StackOverflow { thread } => write!(f, "stack overflow in thread {}", thread),
            Fatal::MutexNotOwned { caller: Some(t) } => {
                write!(f, "thread {} unlocked a mutex it does not hold", t)
            }
            Fatal::MutexNotOwned { caller: None } => write!(f, "unlock of a mutex with no caller"),
            Fatal::MutexRelock { thread } => {
                write!(f, "thread {} locked a mutex it already holds", thread)
            }
            Fatal::StaleThread { thread } => write!(f, "thread {} does not exist", thread),
            Fatal::DuplicateThread { thread } => write!(f, "thread {} initialized twice", thread),
            Fatal::AlreadyReady { thread } => write!(f, "thread {} is already ready", thread),
            Fatal::MutexWaiterReadied { thread } => {
                write!(f, "thread {} readied while waiting for a mutex", thread)
            }
            Fatal::IdleBlocked { thread } => write!(f, "idle thread {} cannot block", thread),
            Fatal::ExitInInterrupt => write!(f, "thread exit from interrupt context"),
            Fatal::NotStarted => write!(f, "scheduler not started"),
        }
    }
}

/// Kernel panic. Logs the cause and hands over to the panic handler
/// (`panic-halt` on target firmware).
#[cold]
#[track_caller]
pub fn fatal(reason: Fatal) -> ! {
    log::error!("kernel panic: {}", reason);
    panic!("kernel panic: {}", reason)
}
