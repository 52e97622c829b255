//! # Thread Control Block
//!
//! Defines the thread model: ids, states, creation flags, the TCB itself
//! and the fixed-capacity table that stores every TCB.
//!
//! TCBs never move and never point at each other. Every cross-reference
//! (run-queue links, mutex waiters, blocked senders) is a [`ThreadId`]:
//! the TCB's index in the [`ThreadTable`] tagged with the slot's
//! generation, so an id kept past its thread's exit never names the next
//! thread created in that slot.

use core::fmt;
use core::mem::size_of;

use bitflags::bitflags;

use crate::config::{MAX_THREADS, STACK_SENTINEL};
use crate::error::{fatal, Fatal, KernelError, KernelResult};
use crate::sync::msg::Mailbox;

// ---------------------------------------------------------------------------
// Identifiers and entry points
// ---------------------------------------------------------------------------

/// Handle of a thread: slot index in the low byte, slot generation in the
/// high byte.
///
/// The slot is reused once the thread has exited, but under a new
/// generation. Passing the old id to a kernel operation afterwards is
/// fatal; inspection calls just report the thread as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u16);

impl ThreadId {
    /// Id of the first thread created in slot `index`.
    pub const fn new(index: usize) -> Self {
        Self::with_generation(index, 0)
    }

    pub const fn with_generation(index: usize, generation: u8) -> Self {
        Self(((generation as u16) << 8) | (index as u8) as u16)
    }

    /// Rebuild an id passed through a `usize` (a thread argument, say).
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw as u16)
    }

    pub const fn into_raw(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0xff) as usize
    }

    #[inline]
    pub const fn generation(self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation() {
            0 => write!(f, "{}", self.index()),
            g => write!(f, "{}.{}", self.index(), g),
        }
    }
}

/// Thread entry point. Called once with the `arg` given at creation.
pub type ThreadEntry = extern "C" fn(usize);

/// Where a thread lands when its entry function returns.
pub type ThreadReturn = extern "C" fn() -> !;

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///              ready()                     schedule()
///   create ──────────────► Pending ◄──────────────────► Running
///                            ▲    preempt / yield          │
///                            │                             │ lock / send /
///                            │ ready() / wakeup()          │ receive / sleep
///                            │                             ▼
///                            └─────────────────────── Blocked* / Sleeping
///
///   Running ── exit ──► Zombie ── switched off its stack ──► (slot freed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Owns the CPU. Exactly one thread is in this state once started.
    Running,
    /// Ready to run, queued in the run queue of its priority.
    Pending,
    /// Waiting for a mutex to be handed over.
    BlockedMutex,
    /// Waiting for a message.
    BlockedReceive,
    /// Waiting for the receiver to take its message.
    BlockedSend,
    /// Message delivered, waiting for `msg_reply`.
    BlockedReply,
    /// Waiting for a tick deadline or an explicit wakeup.
    Sleeping,
    /// Taken out of scheduling until resumed.
    Stopped,
    /// Exited; the slot is freed once the CPU has left its stack.
    Zombie,
}

impl ThreadState {
    /// Blocked on a kernel object (mutex or message).
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ThreadState::BlockedMutex
                | ThreadState::BlockedReceive
                | ThreadState::BlockedSend
                | ThreadState::BlockedReply
        )
    }
}

bitflags! {
    /// Options given to `thread_create`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u8 {
        /// Do not reschedule right after creation, even if the new thread
        /// is more urgent than the creator.
        const WITHOUT_YIELD = 1 << 0;
        /// Fill the stack with `STACK_SENTINEL` for usage measurement and
        /// bottom-of-stack overflow detection.
        const STACKTEST = 1 << 1;
        /// Create the thread asleep; it runs after `wakeup()`.
        const SLEEPING = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Intrusive list link
// ---------------------------------------------------------------------------

/// Position of a thread in whichever list currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListLink {
    pub prev: Option<ThreadId>,
    pub next: Option<ThreadId>,
}

impl ListLink {
    pub const fn unlinked() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block (TCB).
///
/// The stack memory itself is owned by the thread; the TCB keeps only its
/// bounds. `stack_pointer` is meaningful only while the thread is off the
/// CPU: it is the token the context layer restores from.
pub struct ThreadControlBlock {
    pub(crate) id: ThreadId,
    pub(crate) priority: u8,
    pub(crate) state: ThreadState,
    pub(crate) flags: ThreadFlags,
    pub(crate) stack_pointer: usize,
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,
    pub(crate) rq_entry: ListLink,
    pub(crate) name: &'static str,
    /// Tick at which a sleeping thread is readied. `None` sleeps forever.
    pub(crate) wake_at: Option<u64>,
    /// Ticks consumed from the current time slice.
    pub(crate) slice_used: u32,
    pub(crate) mailbox: Mailbox,
}

// Safety: `stack_base` points into the thread's own stack, which is only
// read through the scheduler, itself only reachable inside the kernel
// critical section.
unsafe impl Send for ThreadControlBlock {}

impl ThreadControlBlock {
    pub(crate) fn new(
        id: ThreadId,
        priority: u8,
        flags: ThreadFlags,
        stack_base: *mut u8,
        stack_size: usize,
        stack_pointer: usize,
        name: &'static str,
    ) -> Self {
        Self {
            id,
            priority,
            state: ThreadState::Stopped,
            flags,
            stack_pointer,
            stack_base,
            stack_size,
            rq_entry: ListLink::unlinked(),
            name,
            wake_at: None,
            slice_used: 0,
            mailbox: Mailbox::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    /// Lowest usable address of the stack.
    pub fn stack_base(&self) -> usize {
        self.stack_base as usize
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Check whether `sp` lies inside this thread's stack and, for
    /// `STACKTEST` threads, that the bottom sentinel word is intact.
    pub fn stack_intact(&self, sp: usize) -> bool {
        let base = self.stack_base as usize;
        if sp < base || sp > base + self.stack_size {
            return false;
        }
        if self.flags.contains(ThreadFlags::STACKTEST) {
            // Safety: base is word aligned and inside the thread's stack.
            let bottom = unsafe { (self.stack_base as *const usize).read_volatile() };
            return bottom == STACK_SENTINEL;
        }
        true
    }

    /// Bytes at the bottom of the stack that were never written, for
    /// `STACKTEST` threads.
    pub fn stack_free(&self) -> Option<usize> {
        if !self.flags.contains(ThreadFlags::STACKTEST) {
            return None;
        }
        let words = self.stack_size / size_of::<usize>();
        let base = self.stack_base as *const usize;
        let mut untouched = 0;
        while untouched < words {
            // Safety: `untouched < words` keeps the read inside the stack.
            let word = unsafe { base.add(untouched).read_volatile() };
            if word != STACK_SENTINEL {
                break;
            }
            untouched += 1;
        }
        Some(untouched * size_of::<usize>())
    }
}

/// Overwrite a whole stack with `STACK_SENTINEL`.
pub(crate) fn fill_sentinel(stack: &mut [u8]) {
    for word in stack.chunks_exact_mut(size_of::<usize>()) {
        word.copy_from_slice(&STACK_SENTINEL.to_ne_bytes());
    }
}

// ---------------------------------------------------------------------------
// Static stacks
// ---------------------------------------------------------------------------

/// Word-aligned stack memory for a thread, meant to live in a `static`.
#[repr(C, align(8))]
pub struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Self([0; N])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hand out a `&'static mut [u8]` stack of `$size` bytes, backed by a
/// static private to this expansion. Evaluates to `None` if the same
/// expansion is reached twice.
#[macro_export]
macro_rules! static_stack {
    ($size:expr) => {{
        static mut STACK: $crate::thread::Stack<{ $size }> = $crate::thread::Stack::new();
        static TAKEN: ::core::sync::atomic::AtomicBool = ::core::sync::atomic::AtomicBool::new(false);
        if TAKEN.swap(true, ::core::sync::atomic::Ordering::AcqRel) {
            None
        } else {
            // Safety: the flag above lets exactly one caller through.
            Some(unsafe { (*::core::ptr::addr_of_mut!(STACK)).as_mut_slice() })
        }
    }};
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// Fixed-capacity TCB store indexed by [`ThreadId`].
pub struct ThreadTable {
    slots: [Option<ThreadControlBlock>; MAX_THREADS],
    /// Generation the next thread created in each slot gets.
    generations: [u8; MAX_THREADS],
    count: usize,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_THREADS],
            generations: [0; MAX_THREADS],
            count: 0,
        }
    }

    /// Id for a thread created in the first free slot, if any.
    pub fn free_slot(&self) -> Option<ThreadId> {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .map(|i| ThreadId::with_generation(i, self.generations[i]))
    }

    pub(crate) fn insert(&mut self, tcb: ThreadControlBlock) {
        let index = tcb.id.index();
        if self.slots[index].is_some() {
            fatal(Fatal::DuplicateThread { thread: tcb.id });
        }
        self.slots[index] = Some(tcb);
        self.count += 1;
    }

    pub(crate) fn free(&mut self, id: ThreadId) {
        if self.get(id).is_none() {
            return;
        }
        self.slots[id.index()] = None;
        self.generations[id.index()] = id.generation().wrapping_add(1);
        self.count -= 1;
    }

    /// The thread `id` names, if it is still alive (zombies included).
    pub fn get(&self, id: ThreadId) -> Option<&ThreadControlBlock> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .filter(|t| t.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadControlBlock> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .filter(|t| t.id == id)
    }

    /// Resolve an id handed in by a caller. An id that was never issued is
    /// `NoSuchThread`; one whose thread has exited is fatal.
    pub(crate) fn lookup(&self, id: ThreadId) -> KernelResult<&ThreadControlBlock> {
        if let Some(tcb) = self.get(id) {
            return Ok(tcb);
        }
        match self.generations.get(id.index()) {
            Some(&next) if next != id.generation() => fatal(Fatal::StaleThread { thread: id }),
            _ => Err(KernelError::NoSuchThread),
        }
    }

    /// TCB of a thread the kernel itself holds a reference to. A miss
    /// means kernel bookkeeping is corrupt.
    pub(crate) fn tcb(&self, id: ThreadId) -> &ThreadControlBlock {
        self.get(id)
            .unwrap_or_else(|| fatal(Fatal::StaleThread { thread: id }))
    }

    pub(crate) fn tcb_mut(&mut self, id: ThreadId) -> &mut ThreadControlBlock {
        self.get_mut(id)
            .unwrap_or_else(|| fatal(Fatal::StaleThread { thread: id }))
    }

    /// Number of allocated slots, zombies included.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadControlBlock> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
