//! Kernel mutex with direct hand-off.
//!
//! Unlocking a contended mutex passes ownership straight to the first
//! waiter instead of releasing it and letting the waiters race. A woken
//! waiter therefore never has to retry: when it runs again it holds the
//! lock. Waiters are served in arrival order.
//!
//! There is no priority inheritance.

use core::cell::Cell;
use core::task::Poll;

use crate::arch::Context;
use crate::error::{fatal, Fatal};
use crate::list::ThreadList;
use crate::scheduler::Scheduler;
use crate::thread::{ThreadId, ThreadState};

#[derive(Debug, Clone, Copy)]
struct MutexState {
    owner: Option<ThreadId>,
    waiters: ThreadList,
}

/// A mutex usable from a `static`. Every operation takes the scheduler,
/// which already serializes access.
pub struct Mutex {
    state: Cell<MutexState>,
}

// Safety: the state is only touched through methods that also take
// `&mut Scheduler`, which is only reachable inside the kernel critical
// section.
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: Cell::new(MutexState {
                owner: None,
                waiters: ThreadList::new(),
            }),
        }
    }

    /// Lock for the running thread. Returns `Pending` if it had to block;
    /// it owns the mutex once it runs again.
    ///
    /// Locking a mutex the caller already holds would deadlock and is
    /// fatal.
    pub fn lock<C: Context>(&self, sched: &mut Scheduler<C>) -> Poll<()> {
        let me = sched.expect_running();
        let mut st = self.state.get();
        match st.owner {
            None => {
                st.owner = Some(me);
                self.state.set(st);
                Poll::Ready(())
            }
            Some(owner) if owner == me => fatal(Fatal::MutexRelock { thread: me }),
            Some(owner) => {
                log::trace!("thread {} waits for mutex held by {}", me, owner);
                sched.block_current(ThreadState::BlockedMutex);
                st.waiters.push_back(&mut sched.threads, me);
                self.state.set(st);
                sched.schedule();
                Poll::Pending
            }
        }
    }

    /// Lock only if free.
    pub fn try_lock<C: Context>(&self, sched: &mut Scheduler<C>) -> bool {
        let me = sched.expect_running();
        let mut st = self.state.get();
        if st.owner.is_some() {
            return false;
        }
        st.owner = Some(me);
        self.state.set(st);
        true
    }

    /// Release the mutex, handing it to the first waiter if there is one.
    ///
    /// Only the owner may unlock, and not from interrupt context. Anything
    /// else means two parties believe they hold the lock, which is fatal.
    pub fn unlock<C: Context>(&self, sched: &mut Scheduler<C>) {
        let caller = if sched.in_isr() { None } else { sched.running() };
        let mut st = self.state.get();
        if caller.is_none() || st.owner != caller {
            fatal(Fatal::MutexNotOwned { caller });
        }

        match st.waiters.pop_front(&mut sched.threads) {
            Some(next) => {
                st.owner = Some(next);
                self.state.set(st);
                sched.unblock(next);
            }
            None => {
                st.owner = None;
                self.state.set(st);
            }
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.get().owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    pub fn waiters(&self) -> usize {
        self.state.get().waiters.len()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{check_invariants, spawn, started};

    #[test]
    fn test_uncontended_lock_unlock() {
        let (mut s, _idle) = started();
        let a = spawn(&mut s, 3, "a");
        let m = Mutex::new();
        assert_eq!(m.lock(&mut s), Poll::Ready(()));
        assert_eq!(m.owner(), Some(a));
        assert!(!m.try_lock(&mut s));
        m.unlock(&mut s);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_handoff_to_first_waiter() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        let owner = spawn(&mut s, 6, "owner");
        assert!(m.try_lock(&mut s));

        let w1 = spawn(&mut s, 4, "w1");
        assert_eq!(m.lock(&mut s), Poll::Pending);
        assert_eq!(s.state(w1), Some(ThreadState::BlockedMutex));
        let w2 = spawn(&mut s, 2, "w2");
        assert_eq!(m.lock(&mut s), Poll::Pending);
        assert_eq!(m.waiters(), 2);
        assert_eq!(s.current(), Some(owner));

        // FIFO: w1 arrived first and gets the mutex although w2 is more
        // urgent.
        m.unlock(&mut s);
        assert_eq!(m.owner(), Some(w1));
        assert_eq!(s.current(), Some(w1));
        check_invariants(&s);

        m.unlock(&mut s);
        assert_eq!(m.owner(), Some(w2));
        assert_eq!(s.current(), Some(w2));
        m.unlock(&mut s);
        assert!(!m.is_locked());
        assert_eq!(m.waiters(), 0);
    }

    #[test]
    fn test_unlock_runs_urgent_waiter_immediately() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        let a = spawn(&mut s, 5, "a");
        assert_eq!(m.lock(&mut s), Poll::Ready(()));
        let b = spawn(&mut s, 2, "b");
        assert_eq!(m.lock(&mut s), Poll::Pending);
        assert_eq!(s.current(), Some(a));
        let other = spawn(&mut s, 5, "other");

        m.unlock(&mut s);
        assert_eq!(s.current(), Some(b));
        assert_eq!(m.owner(), Some(b));
        assert_eq!(s.state(a), Some(ThreadState::Pending));
        assert_eq!(s.state(other), Some(ThreadState::Pending));
        check_invariants(&s);
    }

    #[test]
    fn test_try_lock_contended() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        spawn(&mut s, 6, "owner");
        assert!(m.try_lock(&mut s));
        spawn(&mut s, 3, "other");
        assert!(!m.try_lock(&mut s));
        assert_eq!(m.waiters(), 0);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_unlock_by_non_owner_is_fatal() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        spawn(&mut s, 6, "owner");
        assert!(m.try_lock(&mut s));
        spawn(&mut s, 3, "intruder");
        m.unlock(&mut s);
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn test_relock_is_fatal() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        spawn(&mut s, 6, "owner");
        let _ = m.lock(&mut s);
        let _ = m.lock(&mut s);
    }

    #[test]
    #[should_panic(expected = "readied while waiting for a mutex")]
    fn test_readying_a_waiter_is_fatal() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        spawn(&mut s, 5, "owner");
        assert!(m.try_lock(&mut s));
        let waiter = spawn(&mut s, 2, "waiter");
        assert_eq!(m.lock(&mut s), Poll::Pending);
        s.ready(waiter);
    }

    #[test]
    #[should_panic(expected = "unlock of a mutex with no caller")]
    fn test_unlock_from_isr_is_fatal() {
        let (mut s, _idle) = started();
        let m = Mutex::new();
        spawn(&mut s, 6, "owner");
        assert!(m.try_lock(&mut s));
        s.enter_isr();
        m.unlock(&mut s);
    }
}
