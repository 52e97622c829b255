//! # Scheduler
//!
//! Core scheduling logic. Implements strict fixed-priority preemptive
//! scheduling with FIFO round robin among threads of equal priority.
//!
//! ## Invariants
//!
//! - Once started, exactly one thread is `Running`: the one in `current`.
//! - `Pending` threads are exactly the members of the run queue, each in
//!   the level of its own priority. The running thread is not queued.
//! - Outside an ISR, no queued thread is more urgent than the running one.
//!   Inside an ISR a readied thread may wait for the interrupt exit
//!   (see [`IsrReschedule`]).
//!
//! ## Decision vs. switch
//!
//! [`Scheduler::schedule`] decides: it updates `current` and asks the port
//! to switch. The port then calls [`Scheduler::switch_stacks`] (directly,
//! or later from its switch exception), which stores the outgoing stack
//! pointer, runs the stack guard, reaps exited threads and returns the
//! next stack pointer. `active` names the thread whose registers are on
//! the CPU and lags `current` while a pended switch is outstanding.

use crate::arch::Context;
use crate::config::{
    IsrReschedule, SchedulerConfig, IDLE_PRIORITY, MAX_THREADS, MIN_STACK_SIZE, PRIORITY_LEVELS,
};
use crate::error::{fatal, Fatal, KernelError, KernelResult};
use crate::runqueue::RunQueue;
use crate::thread::{
    fill_sentinel, ThreadControlBlock, ThreadEntry, ThreadFlags, ThreadId, ThreadState,
    ThreadTable,
};

/// The kernel state: every TCB, the run queue, and the CPU bookkeeping.
pub struct Scheduler<C: Context> {
    pub(crate) threads: ThreadTable,
    runqueue: RunQueue,
    /// Thread chosen to own the CPU.
    current: Option<ThreadId>,
    /// Thread whose context is live on the CPU.
    active: Option<ThreadId>,
    /// The thread at `IDLE_PRIORITY` found by `start()`. It never blocks.
    idle: Option<ThreadId>,
    port: C,
    config: SchedulerConfig,
    ticks: u64,
    isr_nesting: u8,
    /// Set when an ISR readied a thread and the reschedule waits for the
    /// outermost ISR to exit.
    reschedule_pending: bool,
    started: bool,
}

impl<C: Context> Scheduler<C> {
    pub fn new(port: C) -> Self {
        Self::with_config(port, SchedulerConfig::default())
    }

    pub fn with_config(port: C, config: SchedulerConfig) -> Self {
        Self {
            threads: ThreadTable::new(),
            runqueue: RunQueue::new(),
            current: None,
            active: None,
            idle: None,
            port,
            config,
            ticks: 0,
            isr_nesting: 0,
            reschedule_pending: false,
            started: false,
        }
    }

    // -----------------------------------------------------------------------
    // Thread creation and startup
    // -----------------------------------------------------------------------

    /// Create a thread running `entry(arg)` on `stack`.
    ///
    /// The thread is queued right away (unless created `SLEEPING`) and, if
    /// it is more urgent than the running thread, takes the CPU before this
    /// call returns (unless created `WITHOUT_YIELD`).
    ///
    /// A stack too small for the initial frame is a configuration error
    /// and goes through the fatal path.
    pub fn thread_create(
        &mut self,
        stack: &'static mut [u8],
        priority: u8,
        flags: ThreadFlags,
        entry: ThreadEntry,
        arg: usize,
        name: &'static str,
    ) -> KernelResult<ThreadId> {
        if priority as usize >= PRIORITY_LEVELS {
            return Err(KernelError::InvalidPriority);
        }

        // Word-align both ends.
        let word = core::mem::size_of::<usize>();
        let skip = stack.as_ptr().align_offset(word).min(stack.len());
        let stack = &mut stack[skip..];
        let len = stack.len() & !(word - 1);
        let stack = &mut stack[..len];
        if len < MIN_STACK_SIZE.max(2 * C::FRAME_SIZE) {
            fatal(Fatal::StackTooSmall { size: len });
        }

        let Some(id) = self.threads.free_slot() else {
            log::warn!("thread_create({}): thread table full", name);
            return Err(KernelError::TableFull);
        };

        if flags.contains(ThreadFlags::STACKTEST) {
            fill_sentinel(stack);
        }
        let sp = C::initial_context(stack, entry, arg, crate::kernel::thread_return);
        let base = stack.as_mut_ptr();

        self.threads
            .insert(ThreadControlBlock::new(id, priority, flags, base, len, sp, name));
        log::debug!("created thread {} '{}' at priority {}", id, name, priority);

        if flags.contains(ThreadFlags::SLEEPING) {
            self.threads.tcb_mut(id).state = ThreadState::Sleeping;
        } else {
            self.enqueue(id);
            if !flags.contains(ThreadFlags::WITHOUT_YIELD) {
                self.preempt_if_more_urgent(id);
            }
        }
        Ok(id)
    }

    /// Pick the first thread and mark the scheduler started. Returns the
    /// stack pointer the port must restore to launch it.
    ///
    /// There must be a thread at `IDLE_PRIORITY`; without one the run
    /// queue could drain, which is fatal.
    pub fn start(&mut self) -> usize {
        let idle = self
            .threads
            .iter()
            .find(|t| t.priority == IDLE_PRIORITY && t.state == ThreadState::Pending)
            .map(|t| t.id);
        if idle.is_none() {
            fatal(Fatal::NoIdleThread);
        }
        self.idle = idle;

        let next = self.pop_most_urgent();
        self.current = Some(next);
        self.started = true;
        let sp = self.switch_stacks(None);
        self.port.resume(sp);
        sp
    }

    // -----------------------------------------------------------------------
    // Core scheduling
    // -----------------------------------------------------------------------

    /// Make the most urgent runnable thread the running one.
    ///
    /// The running thread keeps the CPU unless a strictly more urgent
    /// thread is queued. If it is preempted it goes to the tail of its
    /// level. Calling this twice without a readiness change in between
    /// switches at most once.
    pub fn schedule(&mut self) {
        if !self.started {
            return;
        }

        let Some(best) = self.runqueue.highest_priority() else {
            if self.running().is_some() {
                return;
            }
            fatal(Fatal::NoIdleThread);
        };

        if let Some(cur) = self.running() {
            let prio = self.threads.tcb(cur).priority;
            if best >= prio {
                return;
            }
            self.threads.tcb_mut(cur).state = ThreadState::Pending;
            self.runqueue.push_back(&mut self.threads, cur, prio);
        }

        let next = self.pop_most_urgent();
        self.current = Some(next);
        self.context_switch();
    }

    /// Make a blocked, sleeping, stopped or freshly created thread
    /// runnable, preempting the running thread if it is more urgent.
    ///
    /// A thread blocked in a message call is withdrawn from it first: it
    /// leaves the receiver's senders list and its call fails with
    /// `Interrupted`. A mutex waiter cannot be withdrawn (only the mutex
    /// knows its list), so readying one is fatal, as is readying a thread
    /// that is already queued or running.
    pub fn ready(&mut self, id: ThreadId) {
        match self.threads.tcb(id).state {
            ThreadState::BlockedMutex => fatal(Fatal::MutexWaiterReadied { thread: id }),
            ThreadState::BlockedSend | ThreadState::BlockedReceive | ThreadState::BlockedReply => {
                self.msg_abort(id, KernelError::Interrupted);
            }
            _ => {}
        }
        self.unblock(id);
    }

    /// Ready a thread whose wait has been satisfied by the kernel object it
    /// waited on.
    pub(crate) fn unblock(&mut self, id: ThreadId) {
        self.enqueue(id);
        self.preempt_if_more_urgent(id);
    }

    /// Take a pending thread out of its run queue. Returns `false` if it
    /// was not queued. The caller sets the new state.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        let tcb = self.threads.tcb(id);
        if tcb.state != ThreadState::Pending || Some(id) == self.idle {
            return false;
        }
        let prio = tcb.priority;
        self.runqueue.remove(&mut self.threads, id, prio)
    }

    /// Give the CPU to the next thread of the same priority, if any. A
    /// thread alone at its level keeps running.
    ///
    /// Inside an ISR under `IsrReschedule::Defer` the thread is rotated to
    /// the tail now and the switch happens at interrupt exit.
    pub fn yield_now(&mut self) {
        // Nothing to do if already rotated out by a deferred yield.
        let Some(cur) = self.running() else {
            return;
        };
        let prio = self.threads.tcb(cur).priority;
        if self.runqueue.is_level_empty(prio) {
            return;
        }
        self.threads.tcb_mut(cur).state = ThreadState::Pending;
        self.runqueue.push_back(&mut self.threads, cur, prio);
        self.reschedule();
    }

    /// Terminate the running thread. Threads blocked sending to it, or
    /// waiting for its reply, are readied with `PeerExited`. The slot is
    /// reclaimed once the CPU has switched off the thread's stack.
    pub fn exit_current(&mut self) {
        let cur = self.leaving_thread();
        self.threads.tcb_mut(cur).state = ThreadState::Zombie;
        log::debug!("thread {} '{}' exited", cur, self.threads.tcb(cur).name);

        let mut released = [None; MAX_THREADS];
        let count = self.release_peers(cur, &mut released);
        for id in released[..count].iter().flatten() {
            self.enqueue(*id);
        }
        self.reschedule();
    }

    /// Block the running thread in `state`. The caller links it into the
    /// relevant wait list and then calls `schedule()`.
    pub(crate) fn block_current(&mut self, state: ThreadState) -> ThreadId {
        debug_assert!(state.is_blocked());
        let cur = self.leaving_thread();
        self.threads.tcb_mut(cur).state = state;
        cur
    }

    // -----------------------------------------------------------------------
    // Sleep, wakeup, stop, priority
    // -----------------------------------------------------------------------

    /// Sleep for `ticks` ticks. Zero ticks is a yield.
    pub fn sleep(&mut self, ticks: u32) {
        if ticks == 0 {
            self.yield_now();
            return;
        }
        let cur = self.leaving_thread();
        let tcb = self.threads.tcb_mut(cur);
        tcb.state = ThreadState::Sleeping;
        tcb.wake_at = Some(self.ticks + u64::from(ticks));
        self.reschedule();
    }

    /// Sleep until another thread or an ISR calls `wakeup`.
    pub fn sleep_forever(&mut self) {
        let cur = self.leaving_thread();
        let tcb = self.threads.tcb_mut(cur);
        tcb.state = ThreadState::Sleeping;
        tcb.wake_at = None;
        self.reschedule();
    }

    /// Wake a sleeping thread early.
    pub fn wakeup(&mut self, id: ThreadId) -> KernelResult<()> {
        match self.threads.lookup(id)?.state {
            ThreadState::Sleeping => {
                self.unblock(id);
                Ok(())
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Take a running, pending or sleeping thread out of scheduling. The
    /// idle thread cannot be stopped.
    pub fn stop(&mut self, id: ThreadId) -> KernelResult<()> {
        let state = self.threads.lookup(id)?.state;
        if Some(id) == self.idle {
            return Err(KernelError::InvalidState);
        }
        match state {
            ThreadState::Pending => {
                self.remove(id);
            }
            ThreadState::Running | ThreadState::Sleeping => {}
            _ => return Err(KernelError::InvalidState),
        }
        self.threads.tcb_mut(id).state = ThreadState::Stopped;
        if state == ThreadState::Running {
            self.reschedule();
        }
        Ok(())
    }

    /// Put a stopped thread back into scheduling.
    pub fn resume(&mut self, id: ThreadId) -> KernelResult<()> {
        match self.threads.lookup(id)?.state {
            ThreadState::Stopped => {
                self.unblock(id);
                Ok(())
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Change a thread's priority, requeueing and rescheduling as needed.
    /// The idle thread stays at `IDLE_PRIORITY`.
    pub fn set_priority(&mut self, id: ThreadId, priority: u8) -> KernelResult<()> {
        if priority as usize >= PRIORITY_LEVELS {
            return Err(KernelError::InvalidPriority);
        }
        let tcb = self.threads.lookup(id)?;
        let (old, state) = (tcb.priority, tcb.state);
        if old == priority {
            return Ok(());
        }
        if Some(id) == self.idle {
            return Err(KernelError::InvalidState);
        }

        if state == ThreadState::Pending {
            self.runqueue.remove(&mut self.threads, id, old);
            self.threads.tcb_mut(id).priority = priority;
            self.runqueue.push_back(&mut self.threads, id, priority);
        } else {
            self.threads.tcb_mut(id).priority = priority;
        }
        log::debug!("thread {} priority {} -> {}", id, old, priority);

        // A queued thread may now beat the running one, or the running
        // one may have dropped below a queued thread.
        self.reschedule();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick and interrupt bookkeeping
    // -----------------------------------------------------------------------

    /// Periodic timer callback: wakes expired sleepers and, if round robin
    /// is configured, rotates the running thread after its slice.
    pub fn tick(&mut self) {
        self.ticks += 1;

        let mut expired = [None; MAX_THREADS];
        let mut count = 0;
        for t in self.threads.iter() {
            if t.state == ThreadState::Sleeping && t.wake_at.is_some_and(|at| at <= self.ticks) {
                expired[count] = Some(t.id);
                count += 1;
            }
        }
        for id in expired[..count].iter().flatten() {
            self.unblock(*id);
        }

        let (Some(slice), Some(cur)) = (self.config.time_slice, self.running()) else {
            return;
        };
        let tcb = self.threads.tcb_mut(cur);
        tcb.slice_used += 1;
        if tcb.slice_used < slice {
            return;
        }
        tcb.slice_used = 0;
        self.yield_now();
    }

    /// Note entry into an interrupt handler that may call the kernel.
    pub fn enter_isr(&mut self) {
        self.isr_nesting += 1;
    }

    /// Note exit from an interrupt handler; the outermost exit performs
    /// any reschedule deferred while in interrupt context.
    pub fn exit_isr(&mut self) {
        debug_assert!(self.isr_nesting > 0);
        self.isr_nesting = self.isr_nesting.saturating_sub(1);
        if self.isr_nesting == 0 && self.reschedule_pending {
            self.reschedule_pending = false;
            self.schedule();
        }
    }

    #[inline]
    pub fn in_isr(&self) -> bool {
        self.isr_nesting > 0
    }

    // -----------------------------------------------------------------------
    // Context switch bookkeeping
    // -----------------------------------------------------------------------

    /// Second half of a context switch, called by the port.
    ///
    /// `saved_sp` is the outgoing thread's stack pointer after its
    /// registers were pushed (`None` when nothing was running). It is
    /// checked against the thread's stack bounds; leaving them is fatal.
    /// Returns the stack pointer of the thread to restore.
    pub fn switch_stacks(&mut self, saved_sp: Option<usize>) -> usize {
        let prev = self.active;
        if let (Some(prev), Some(sp)) = (prev, saved_sp) {
            let tcb = self.threads.tcb_mut(prev);
            if !tcb.stack_intact(sp) {
                fatal(Fatal::StackOverflow { thread: prev });
            }
            tcb.stack_pointer = sp;
            if tcb.state == ThreadState::Zombie {
                self.threads.free(prev);
            }
        }

        let next = self.current.unwrap_or_else(|| fatal(Fatal::NotStarted));
        self.active = Some(next);
        log::trace!("switch {:?} -> {}", prev, next);
        self.threads.tcb(next).stack_pointer
    }

    fn context_switch(&mut self) {
        if self.current == self.active {
            return;
        }
        if let Some(saved) = self.port.request_switch() {
            let sp = self.switch_stacks(Some(saved));
            self.port.resume(sp);
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Queue a thread without considering preemption.
    pub(crate) fn enqueue(&mut self, id: ThreadId) {
        let tcb = self.threads.tcb_mut(id);
        match tcb.state {
            ThreadState::Pending | ThreadState::Running => {
                fatal(Fatal::AlreadyReady { thread: id })
            }
            ThreadState::Zombie => fatal(Fatal::StaleThread { thread: id }),
            _ => {}
        }
        tcb.state = ThreadState::Pending;
        tcb.wake_at = None;
        let prio = tcb.priority;
        self.runqueue.push_back(&mut self.threads, id, prio);
    }

    fn preempt_if_more_urgent(&mut self, id: ThreadId) {
        let Some(cur) = self.current else {
            return;
        };
        if self.threads.tcb(id).priority < self.threads.tcb(cur).priority {
            self.reschedule();
        }
    }

    /// `schedule()` now, or after the ISR if policy says so.
    fn reschedule(&mut self) {
        if !self.started {
            return;
        }
        if self.in_isr() && self.config.isr_reschedule == IsrReschedule::Defer {
            self.reschedule_pending = true;
        } else {
            self.schedule();
        }
    }

    fn pop_most_urgent(&mut self) -> ThreadId {
        let prio = self
            .runqueue
            .highest_priority()
            .unwrap_or_else(|| fatal(Fatal::NoIdleThread));
        let next = self
            .runqueue
            .pop_front(&mut self.threads, prio)
            .unwrap_or_else(|| fatal(Fatal::NoIdleThread));
        let tcb = self.threads.tcb_mut(next);
        tcb.state = ThreadState::Running;
        tcb.slice_used = 0;
        next
    }

    /// The running thread; calling without one is fatal.
    pub(crate) fn expect_running(&self) -> ThreadId {
        self.current.unwrap_or_else(|| fatal(Fatal::NotStarted))
    }

    /// The running thread, about to block, sleep or exit. The idle thread
    /// must stay runnable, so this is fatal for it.
    fn leaving_thread(&self) -> ThreadId {
        let cur = self.expect_running();
        if Some(cur) == self.idle {
            fatal(Fatal::IdleBlocked { thread: cur });
        }
        cur
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// The running thread, if it is still in the `Running` state.
    pub fn running(&self) -> Option<ThreadId> {
        self.current
            .filter(|id| self.threads.tcb(*id).state == ThreadState::Running)
    }

    /// Thread chosen to own the CPU, whatever its state.
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadControlBlock> {
        self.threads.get(id)
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(id).map(|t| t.state)
    }

    pub fn priority(&self, id: ThreadId) -> Option<u8> {
        self.threads.get(id).map(|t| t.priority)
    }

    pub fn name(&self, id: ThreadId) -> Option<&'static str> {
        self.threads.get(id).map(|t| t.name)
    }

    /// Unused stack bytes of a `STACKTEST` thread.
    pub fn stack_free(&self, id: ThreadId) -> Option<usize> {
        self.threads.get(id).and_then(|t| t.stack_free())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// The idle thread, once started.
    pub fn idle(&self) -> Option<ThreadId> {
        self.idle
    }

    pub fn runqueue(&self) -> &RunQueue {
        &self.runqueue
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn reschedule_pending(&self) -> bool {
        self.reschedule_pending
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn port(&self) -> &C {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut C {
        &mut self.port
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
