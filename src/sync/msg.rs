//! # Message Passing
//!
//! Synchronous, copy-by-value IPC between threads. A message is a small
//! fixed-size [`Msg`]; it is copied from the sender into the receiver, so
//! nothing is shared after delivery.
//!
//! ```text
//!   sender                                      receiver
//!   msg_send ──► receiver BlockedReceive? ──yes─► copy, ready receiver
//!                    │ no
//!                    ├── queue has room? ──yes──► enqueue, return
//!                    │ no
//!                    └── BlockedSend, join receiver's senders list
//!
//!   msg_send_receive: as above, but the sender then waits in
//!   BlockedReply until the receiver calls msg_reply
//! ```
//!
//! Every thread has a [`Mailbox`] embedded in its TCB. It holds the
//! message a blocked sender is offering, the message delivered to a blocked
//! receiver, the list of threads blocked sending to this one and an
//! optional message queue (off by default, see `msg_init_queue`).
//!
//! Blocking calls return `Poll::Pending` after the scheduler has switched
//! away. When the thread runs again, the result is collected with
//! [`Scheduler::msg_take`] or [`Scheduler::msg_send_status`].

use core::task::Poll;

use crate::arch::Context;
use crate::config::{MAX_THREADS, MSG_QUEUE_CAPACITY};
use crate::error::{KernelError, KernelResult};
use crate::list::ThreadList;
use crate::scheduler::Scheduler;
use crate::thread::{ThreadId, ThreadState};

/// A message. `sender` is stamped by the kernel; `None` means it was sent
/// from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msg {
    pub sender: Option<ThreadId>,
    pub kind: u16,
    pub content: usize,
}

impl Msg {
    pub const fn new(kind: u16, content: usize) -> Self {
        Self {
            sender: None,
            kind,
            content,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread queue
// ---------------------------------------------------------------------------

/// Ring buffer of messages. Capacity 0 (the default) disables queueing.
#[derive(Debug)]
pub(crate) struct MsgQueue {
    buf: [Option<Msg>; MSG_QUEUE_CAPACITY],
    head: usize,
    len: usize,
    capacity: usize,
}

impl MsgQueue {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [None; MSG_QUEUE_CAPACITY],
            head: 0,
            len: 0,
            capacity: 0,
        }
    }

    pub(crate) fn push(&mut self, msg: Msg) -> bool {
        if self.len >= self.capacity {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity;
        self.buf[tail] = Some(msg);
        self.len += 1;
        true
    }

    pub(crate) fn pop(&mut self) -> Option<Msg> {
        if self.len == 0 {
            return None;
        }
        let msg = self.buf[self.head].take();
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        msg
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct Mailbox {
    /// Outgoing message while `BlockedSend`, incoming message or reply
    /// once delivered.
    pub(crate) slot: Option<Msg>,
    /// Receiver while `BlockedSend`, thread expected to reply while
    /// `BlockedReply`.
    pub(crate) peer: Option<ThreadId>,
    /// Outcome of the last blocking call, if it failed.
    pub(crate) error: Option<KernelError>,
    /// The blocked send is the first half of a `msg_send_receive`.
    pub(crate) awaiting_reply: bool,
    /// Threads blocked sending to this one, in arrival order.
    pub(crate) senders: ThreadList,
    pub(crate) queue: MsgQueue,
}

impl Mailbox {
    pub(crate) const fn new() -> Self {
        Self {
            slot: None,
            peer: None,
            error: None,
            awaiting_reply: false,
            senders: ThreadList::new(),
            queue: MsgQueue::new(),
        }
    }
}

/// Where `try_deliver` put a message.
enum Delivery {
    /// Copied into a thread blocked in receive; it still has to be readied.
    Direct,
    Queued,
    /// The receiver is busy and its queue is full (or absent).
    Busy,
}

// ---------------------------------------------------------------------------
// Scheduler operations
// ---------------------------------------------------------------------------

impl<C: Context> Scheduler<C> {
    /// Give thread `id` a queue of `capacity` messages. Only allowed while
    /// its queue is empty.
    pub fn msg_init_queue(&mut self, id: ThreadId, capacity: usize) -> KernelResult<()> {
        if capacity > MSG_QUEUE_CAPACITY {
            return Err(KernelError::InvalidArgument);
        }
        self.threads.lookup(id)?;
        let tcb = self.threads.tcb_mut(id);
        if tcb.mailbox.queue.len() > 0 {
            return Err(KernelError::InvalidState);
        }
        tcb.mailbox.queue = MsgQueue::new();
        tcb.mailbox.queue.capacity = capacity;
        Ok(())
    }

    /// Number of messages waiting in `id`'s queue.
    pub fn msg_queued(&self, id: ThreadId) -> Option<usize> {
        self.threads.get(id).map(|t| t.mailbox.queue.len())
    }

    /// Send `msg` to `target`, blocking until it is delivered.
    ///
    /// From interrupt context this never blocks and behaves like
    /// [`Scheduler::msg_try_send`].
    pub fn msg_send(&mut self, target: ThreadId, mut msg: Msg) -> KernelResult<Poll<()>> {
        if self.in_isr() {
            return self.msg_try_send(target, msg).map(Poll::Ready);
        }
        let me = self.expect_running();
        if target == me {
            return Err(KernelError::SendToSelf);
        }
        msg.sender = Some(me);

        match self.try_deliver(target, msg)? {
            Delivery::Direct => {
                self.unblock(target);
                Ok(Poll::Ready(()))
            }
            Delivery::Queued => Ok(Poll::Ready(())),
            Delivery::Busy => {
                self.block_sending(me, target, msg, false);
                self.schedule();
                Ok(Poll::Pending)
            }
        }
    }

    /// Deliver `msg` only if `target` is receiving or has queue room.
    pub fn msg_try_send(&mut self, target: ThreadId, mut msg: Msg) -> KernelResult<()> {
        msg.sender = if self.in_isr() { None } else { self.current() };
        if msg.sender == Some(target) {
            return Err(KernelError::SendToSelf);
        }

        match self.try_deliver(target, msg)? {
            Delivery::Direct => {
                self.unblock(target);
                Ok(())
            }
            Delivery::Queued => Ok(()),
            Delivery::Busy => Err(KernelError::WouldBlock),
        }
    }

    /// Receive a message, blocking until one arrives. Queued messages come
    /// first, then blocked senders in arrival order.
    pub fn msg_receive(&mut self) -> Poll<Msg> {
        let me = self.expect_running();
        if let Some(msg) = self.take_next(me) {
            return Poll::Ready(msg);
        }

        self.block_current(ThreadState::BlockedReceive);
        let mailbox = &mut self.threads.tcb_mut(me).mailbox;
        mailbox.slot = None;
        mailbox.error = None;
        self.schedule();
        Poll::Pending
    }

    /// Receive a message only if one is already waiting.
    pub fn msg_try_receive(&mut self) -> KernelResult<Msg> {
        let me = self.expect_running();
        self.take_next(me).ok_or(KernelError::WouldBlock)
    }

    /// Send `msg` to `target` and block until it replies. The reply is
    /// collected with [`Scheduler::msg_take`].
    pub fn msg_send_receive(&mut self, target: ThreadId, mut msg: Msg) -> KernelResult<()> {
        if self.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        let me = self.expect_running();
        if target == me {
            return Err(KernelError::SendToSelf);
        }
        msg.sender = Some(me);

        let mailbox = &mut self.threads.tcb_mut(me).mailbox;
        mailbox.slot = None;
        mailbox.error = None;

        // Block the caller before the target becomes runnable, so a switch
        // to the target never sees the caller still Running.
        match self.try_deliver(target, msg)? {
            Delivery::Direct => {
                self.await_reply(me, target);
                self.enqueue(target);
            }
            Delivery::Queued => self.await_reply(me, target),
            Delivery::Busy => self.block_sending(me, target, msg, true),
        }
        self.schedule();
        Ok(())
    }

    /// Answer a message received from a thread blocked in
    /// `msg_send_receive`. The reply is copied into the original sender,
    /// which is readied.
    pub fn msg_reply(&mut self, received: &Msg, mut reply: Msg) -> KernelResult<()> {
        let target = received.sender.ok_or(KernelError::InvalidState)?;
        let me = if self.in_isr() { None } else { self.running() };

        let tcb = self.threads.get_mut(target).ok_or(KernelError::NoSuchThread)?;
        if tcb.state != ThreadState::BlockedReply {
            return Err(KernelError::InvalidState);
        }
        if me.is_some() && tcb.mailbox.peer != me {
            return Err(KernelError::InvalidState);
        }

        reply.sender = me;
        tcb.mailbox.slot = Some(reply);
        tcb.mailbox.peer = None;
        tcb.mailbox.awaiting_reply = false;
        self.unblock(target);
        Ok(())
    }

    /// Collect the message (or reply) delivered while blocked.
    pub fn msg_take(&mut self) -> KernelResult<Msg> {
        let me = self.expect_running();
        let mailbox = &mut self.threads.tcb_mut(me).mailbox;
        if let Some(err) = mailbox.error.take() {
            return Err(err);
        }
        mailbox.slot.take().ok_or(KernelError::WouldBlock)
    }

    /// Outcome of a `msg_send` that returned `Pending`.
    pub fn msg_send_status(&mut self) -> KernelResult<()> {
        let me = self.expect_running();
        match self.threads.tcb_mut(me).mailbox.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn try_deliver(&mut self, target: ThreadId, msg: Msg) -> KernelResult<Delivery> {
        if self.threads.lookup(target)?.state == ThreadState::Zombie {
            return Err(KernelError::NoSuchThread);
        }
        let tcb = self.threads.tcb_mut(target);

        if tcb.state == ThreadState::BlockedReceive {
            tcb.mailbox.slot = Some(msg);
            return Ok(Delivery::Direct);
        }
        if tcb.mailbox.queue.push(msg) {
            log::trace!("msg {:#x} queued for thread {}", msg.kind, target);
            return Ok(Delivery::Queued);
        }
        Ok(Delivery::Busy)
    }

    fn block_sending(&mut self, me: ThreadId, target: ThreadId, msg: Msg, awaiting_reply: bool) {
        self.block_current(ThreadState::BlockedSend);
        let mailbox = &mut self.threads.tcb_mut(me).mailbox;
        mailbox.slot = Some(msg);
        mailbox.peer = Some(target);
        mailbox.error = None;
        mailbox.awaiting_reply = awaiting_reply;

        let mut senders = self.threads.tcb(target).mailbox.senders;
        senders.push_back(&mut self.threads, me);
        self.threads.tcb_mut(target).mailbox.senders = senders;
    }

    fn await_reply(&mut self, me: ThreadId, target: ThreadId) {
        self.block_current(ThreadState::BlockedReply);
        let mailbox = &mut self.threads.tcb_mut(me).mailbox;
        mailbox.peer = Some(target);
        mailbox.awaiting_reply = true;
    }

    /// Next message for `me`: the queue head, else the first blocked
    /// sender's. A queue slot freed here is refilled from the senders list
    /// so arrival order is kept.
    fn take_next(&mut self, me: ThreadId) -> Option<Msg> {
        if let Some(msg) = self.threads.tcb_mut(me).mailbox.queue.pop() {
            if let Some((sender, next)) = self.pop_sender(me) {
                self.threads.tcb_mut(me).mailbox.queue.push(next);
                self.release_sender(sender, me);
            }
            return Some(msg);
        }

        let (sender, msg) = self.pop_sender(me)?;
        self.release_sender(sender, me);
        Some(msg)
    }

    fn pop_sender(&mut self, me: ThreadId) -> Option<(ThreadId, Msg)> {
        let mut senders = self.threads.tcb(me).mailbox.senders;
        let sender = senders.pop_front(&mut self.threads)?;
        self.threads.tcb_mut(me).mailbox.senders = senders;

        let outgoing = self.threads.tcb_mut(sender).mailbox.slot.take();
        debug_assert!(outgoing.is_some(), "blocked sender {} has no message", sender);
        Some((sender, outgoing.unwrap_or_default()))
    }

    /// Move a sender whose message was taken on to its next state.
    fn release_sender(&mut self, sender: ThreadId, receiver: ThreadId) {
        let mailbox = &mut self.threads.tcb_mut(sender).mailbox;
        if mailbox.awaiting_reply {
            mailbox.peer = Some(receiver);
            self.threads.tcb_mut(sender).state = ThreadState::BlockedReply;
        } else {
            mailbox.peer = None;
            self.unblock(sender);
        }
    }

    /// Withdraw `id` from the message call it is blocked in, which then
    /// fails with `err`. A blocked sender leaves its receiver's senders
    /// list and its message is dropped. The caller readies `id`.
    pub(crate) fn msg_abort(&mut self, id: ThreadId, err: KernelError) {
        let tcb = self.threads.tcb(id);
        if let (ThreadState::BlockedSend, Some(receiver)) = (tcb.state, tcb.mailbox.peer) {
            let mut senders = self.threads.tcb(receiver).mailbox.senders;
            senders.remove(&mut self.threads, id);
            self.threads.tcb_mut(receiver).mailbox.senders = senders;
        }

        let mailbox = &mut self.threads.tcb_mut(id).mailbox;
        mailbox.slot = None;
        mailbox.peer = None;
        mailbox.awaiting_reply = false;
        mailbox.error = Some(err);
        log::debug!("thread {} interrupted in a message call: {}", id, err);
    }

    /// Unblock everything waiting on `id` before it exits: threads blocked
    /// sending to it and threads waiting for its reply. They are marked
    /// with `PeerExited` and written to `out`; the caller readies them.
    pub(crate) fn release_peers(
        &mut self,
        id: ThreadId,
        out: &mut [Option<ThreadId>; MAX_THREADS],
    ) -> usize {
        let mut count = 0;

        let mut senders = self.threads.tcb(id).mailbox.senders;
        while let Some(sender) = senders.pop_front(&mut self.threads) {
            out[count] = Some(sender);
            count += 1;
        }
        self.threads.tcb_mut(id).mailbox.senders = senders;

        for t in self.threads.iter() {
            if t.state == ThreadState::BlockedReply && t.mailbox.peer == Some(id) {
                out[count] = Some(t.id);
                count += 1;
            }
        }

        for peer in out[..count].iter().flatten() {
            let mailbox = &mut self.threads.tcb_mut(*peer).mailbox;
            mailbox.slot = None;
            mailbox.peer = None;
            mailbox.awaiting_reply = false;
            mailbox.error = Some(KernelError::PeerExited);
        }
        if count > 0 {
            log::debug!("thread {} exited with {} peers waiting", id, count);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{check_invariants, spawn, started};

    #[test]
    fn test_queue_ring_wraps() {
        let mut q = MsgQueue::new();
        assert!(!q.push(Msg::new(1, 0)));
        q.capacity = 2;
        assert!(q.push(Msg::new(1, 10)));
        assert!(q.push(Msg::new(1, 11)));
        assert!(!q.push(Msg::new(1, 12)));
        assert_eq!(q.pop().map(|m| m.content), Some(10));
        assert!(q.push(Msg::new(1, 12)));
        assert_eq!(q.pop().map(|m| m.content), Some(11));
        assert_eq!(q.pop().map(|m| m.content), Some(12));
        assert_eq!(q.pop(), None);
        assert_eq!(q.capacity(), 2);
    }

    #[test]
    fn test_send_to_blocked_receiver() {
        let (mut s, _idle) = started();
        let sender = spawn(&mut s, 5, "sender");
        let receiver = spawn(&mut s, 2, "receiver");
        assert_eq!(s.current(), Some(receiver));

        assert_eq!(s.msg_receive(), Poll::Pending);
        assert_eq!(s.state(receiver), Some(ThreadState::BlockedReceive));
        assert_eq!(s.current(), Some(sender));

        let r = s.msg_send(receiver, Msg::new(7, 42)).unwrap();
        assert_eq!(r, Poll::Ready(()));
        // The receiver is more urgent and runs at once.
        assert_eq!(s.current(), Some(receiver));
        let msg = s.msg_take().unwrap();
        assert_eq!((msg.kind, msg.content), (7, 42));
        assert_eq!(msg.sender, Some(sender));
        assert_eq!(s.state(sender), Some(ThreadState::Pending));
        check_invariants(&s);
    }

    #[test]
    fn test_send_blocks_until_received() {
        let (mut s, _idle) = started();
        let receiver = spawn(&mut s, 5, "receiver");
        let sender = spawn(&mut s, 2, "sender");

        assert_eq!(s.msg_send(receiver, Msg::new(1, 99)), Ok(Poll::Pending));
        assert_eq!(s.state(sender), Some(ThreadState::BlockedSend));
        assert_eq!(s.current(), Some(receiver));

        let msg = s.msg_receive();
        assert_eq!(msg.map(|m| m.content), Poll::Ready(99));
        // Taking the message released the more urgent sender.
        assert_eq!(s.current(), Some(sender));
        assert_eq!(s.msg_send_status(), Ok(()));
        check_invariants(&s);
    }

    #[test]
    fn test_blocked_senders_served_in_order() {
        let (mut s, _idle) = started();
        let receiver = spawn(&mut s, 9, "receiver");
        let a = spawn(&mut s, 3, "a");
        assert_eq!(s.msg_send(receiver, Msg::new(0, 1)), Ok(Poll::Pending));
        let b = spawn(&mut s, 4, "b");
        assert_eq!(s.msg_send(receiver, Msg::new(0, 2)), Ok(Poll::Pending));
        assert_eq!(s.current(), Some(receiver));

        assert_eq!(s.msg_try_receive().map(|m| m.sender), Ok(Some(a)));
        assert_eq!(s.current(), Some(a));
        s.exit_current();
        // b is still blocked; only the receiver can release it.
        assert_eq!(s.current(), Some(receiver));
        assert_eq!(s.msg_try_receive().map(|m| m.content), Ok(2));
        assert_eq!(s.current(), Some(b));
        s.exit_current();
        assert_eq!(s.current(), Some(receiver));
        assert_eq!(s.msg_try_receive(), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_queue_absorbs_then_blocks() {
        let (mut s, _idle) = started();
        let receiver = spawn(&mut s, 6, "receiver");
        s.msg_init_queue(receiver, 2).unwrap();
        let sender = spawn(&mut s, 2, "sender");

        assert_eq!(s.msg_send(receiver, Msg::new(0, 1)), Ok(Poll::Ready(())));
        assert_eq!(s.msg_try_send(receiver, Msg::new(0, 2)), Ok(()));
        assert_eq!(s.msg_queued(receiver), Some(2));
        assert_eq!(
            s.msg_try_send(receiver, Msg::new(0, 3)),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(s.msg_send(receiver, Msg::new(0, 3)), Ok(Poll::Pending));
        assert_eq!(s.current(), Some(receiver));

        // The freed queue slot is refilled from the blocked sender.
        assert_eq!(s.msg_receive().map(|m| m.content), Poll::Ready(1));
        assert_eq!(s.current(), Some(sender));
        s.sleep_forever();
        assert_eq!(s.msg_queued(receiver), Some(2));
        assert_eq!(s.msg_try_receive().map(|m| m.content), Ok(2));
        assert_eq!(s.msg_try_receive().map(|m| m.content), Ok(3));
        assert_eq!(s.msg_queued(receiver), Some(0));
    }

    #[test]
    fn test_init_queue_limits() {
        let (mut s, idle) = started();
        assert_eq!(
            s.msg_init_queue(idle, MSG_QUEUE_CAPACITY + 1),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(s.msg_init_queue(idle, MSG_QUEUE_CAPACITY), Ok(()));
    }

    #[test]
    fn test_send_errors() {
        let (mut s, idle) = started();
        let me = spawn(&mut s, 3, "me");
        assert_eq!(
            s.msg_send(me, Msg::new(0, 0)),
            Err(KernelError::SendToSelf)
        );
        assert_eq!(
            s.msg_send(ThreadId::new(12), Msg::new(0, 0)),
            Err(KernelError::NoSuchThread)
        );
        // Idle is pending, not receiving, and has no queue.
        assert_eq!(
            s.msg_try_send(idle, Msg::new(0, 0)),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(s.current(), Some(me));
    }

    #[test]
    fn test_send_from_isr_never_blocks() {
        let (mut s, idle) = started();
        let driver = spawn(&mut s, 1, "driver");
        assert_eq!(s.msg_receive(), Poll::Pending);
        assert_eq!(s.current(), Some(idle));

        s.enter_isr();
        assert_eq!(s.msg_send(driver, Msg::new(3, 0)), Ok(Poll::Ready(())));
        assert_eq!(
            s.msg_send(driver, Msg::new(3, 1)),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(s.current(), Some(idle));
        s.exit_isr();

        assert_eq!(s.current(), Some(driver));
        let msg = s.msg_take().unwrap();
        assert_eq!(msg.sender, None);
        assert_eq!(msg.content, 0);
    }

    #[test]
    fn test_send_receive_and_reply() {
        let (mut s, _idle) = started();
        let server = spawn(&mut s, 4, "server");
        let client = spawn(&mut s, 2, "client");

        s.msg_send_receive(server, Msg::new(10, 5)).unwrap();
        assert_eq!(s.state(client), Some(ThreadState::BlockedSend));
        assert_eq!(s.current(), Some(server));

        let Poll::Ready(request) = s.msg_receive() else {
            panic!("request should be waiting");
        };
        assert_eq!(request.sender, Some(client));
        assert_eq!(s.state(client), Some(ThreadState::BlockedReply));
        assert_eq!(s.current(), Some(server));

        s.msg_reply(&request, Msg::new(11, request.content * 2)).unwrap();
        assert_eq!(s.current(), Some(client));
        let reply = s.msg_take().unwrap();
        assert_eq!((reply.kind, reply.content), (11, 10));
        assert_eq!(reply.sender, Some(server));
        check_invariants(&s);
    }

    #[test]
    fn test_send_receive_to_waiting_server() {
        let (mut s, _idle) = started();
        let server = spawn(&mut s, 2, "server");
        assert_eq!(s.msg_receive(), Poll::Pending);
        let client = spawn(&mut s, 5, "client");
        assert_eq!(s.current(), Some(client));

        s.msg_send_receive(server, Msg::new(1, 1)).unwrap();
        assert_eq!(s.state(client), Some(ThreadState::BlockedReply));
        assert_eq!(s.current(), Some(server));

        let request = s.msg_take().unwrap();
        s.msg_reply(&request, Msg::new(2, 2)).unwrap();
        // The client is less urgent; the server keeps running.
        assert_eq!(s.current(), Some(server));
        assert_eq!(s.state(client), Some(ThreadState::Pending));
    }

    #[test]
    fn test_reply_to_thread_not_waiting() {
        let (mut s, idle) = started();
        spawn(&mut s, 3, "me");
        let fake = Msg {
            sender: Some(idle),
            ..Msg::new(0, 0)
        };
        assert_eq!(s.msg_reply(&fake, Msg::new(0, 0)), Err(KernelError::InvalidState));
        assert_eq!(s.msg_reply(&Msg::new(0, 0), Msg::new(0, 0)), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_server_exit_releases_client() {
        let (mut s, _idle) = started();
        let server = spawn(&mut s, 4, "server");
        let client = spawn(&mut s, 2, "client");
        s.msg_send_receive(server, Msg::new(1, 1)).unwrap();
        assert_eq!(s.current(), Some(server));
        assert!(s.msg_receive().is_ready());

        // Exit without replying.
        s.exit_current();
        assert_eq!(s.current(), Some(client));
        assert_eq!(s.msg_take(), Err(KernelError::PeerExited));
        check_invariants(&s);
    }

    #[test]
    fn test_ready_withdraws_blocked_sender() {
        let (mut s, _idle) = started();
        let receiver = spawn(&mut s, 6, "receiver");
        let sender = spawn(&mut s, 3, "sender");
        assert_eq!(s.msg_send(receiver, Msg::new(0, 5)), Ok(Poll::Pending));
        assert_eq!(s.current(), Some(receiver));

        s.ready(sender);
        assert_eq!(s.current(), Some(sender));
        assert_eq!(s.msg_send_status(), Err(KernelError::Interrupted));
        check_invariants(&s);

        // The withdrawn message is gone from the receiver's side.
        s.sleep(1);
        assert_eq!(s.current(), Some(receiver));
        assert_eq!(s.msg_try_receive(), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_ready_interrupts_receive_and_reply_waits() {
        let (mut s, _idle) = started();
        let server = spawn(&mut s, 4, "server");
        assert_eq!(s.msg_receive(), Poll::Pending);
        let waker = spawn(&mut s, 6, "waker");
        assert_eq!(s.current(), Some(waker));

        s.ready(server);
        assert_eq!(s.current(), Some(server));
        assert_eq!(s.msg_take(), Err(KernelError::Interrupted));

        // A client waiting for a reply is released the same way; a late
        // reply is then refused.
        let client = spawn(&mut s, 2, "client");
        s.msg_send_receive(server, Msg::new(1, 1)).unwrap();
        assert_eq!(s.current(), Some(server));
        let req = s.msg_try_receive().unwrap();
        assert_eq!(s.state(client), Some(ThreadState::BlockedReply));
        s.ready(client);
        assert_eq!(s.current(), Some(client));
        assert_eq!(s.msg_take(), Err(KernelError::Interrupted));
        s.sleep(1);
        assert_eq!(s.current(), Some(server));
        assert_eq!(s.msg_reply(&req, Msg::new(2, 0)), Err(KernelError::InvalidState));
        check_invariants(&s);
    }

    #[test]
    fn test_receiver_exit_releases_blocked_senders() {
        let (mut s, _idle) = started();
        let receiver = spawn(&mut s, 6, "receiver");
        let sender = spawn(&mut s, 3, "sender");
        assert_eq!(s.msg_send(receiver, Msg::new(0, 0)), Ok(Poll::Pending));
        assert_eq!(s.current(), Some(receiver));

        s.exit_current();
        assert_eq!(s.current(), Some(sender));
        assert_eq!(s.msg_send_status(), Err(KernelError::PeerExited));
        assert!(s.thread(receiver).is_none());
        check_invariants(&s);
    }
}
