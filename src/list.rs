//! FIFO list of threads, linked through the `rq_entry` field of each TCB.
//!
//! The list itself is two ids and a length, so it is `Copy` and can be
//! embedded anywhere: one per run-queue level, one per mutex, one per
//! receiving thread. Because every TCB has a single link, a thread is in
//! at most one list at a time.

use crate::thread::{ListLink, ThreadId, ThreadTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadList {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
    len: u16,
}

impl ThreadList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn front(&self) -> Option<ThreadId> {
        self.head
    }

    pub fn push_back(&mut self, threads: &mut ThreadTable, id: ThreadId) {
        let link = &mut threads.tcb_mut(id).rq_entry;
        debug_assert_eq!(*link, ListLink::unlinked(), "thread {} already linked", id);
        link.prev = self.tail;
        link.next = None;

        match self.tail {
            Some(tail) => threads.tcb_mut(tail).rq_entry.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn pop_front(&mut self, threads: &mut ThreadTable) -> Option<ThreadId> {
        let head = self.head?;
        self.unlink(threads, head);
        Some(head)
    }

    /// Remove `id` if it is a member. O(1). A thread linked into a
    /// different list must not be passed.
    pub fn remove(&mut self, threads: &mut ThreadTable, id: ThreadId) -> bool {
        let link = threads.tcb(id).rq_entry;
        let member = match link.prev {
            Some(_) => true,
            None => self.head == Some(id),
        };
        if member {
            self.unlink(threads, id);
        }
        member
    }

    fn unlink(&mut self, threads: &mut ThreadTable, id: ThreadId) {
        let link = core::mem::take(&mut threads.tcb_mut(id).rq_entry);

        match link.prev {
            Some(prev) => threads.tcb_mut(prev).rq_entry.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => threads.tcb_mut(next).rq_entry.prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
    }

    /// Walk the list front to back.
    pub fn iter<'a>(&self, threads: &'a ThreadTable) -> Iter<'a> {
        Iter {
            threads,
            next: self.head,
        }
    }
}

pub struct Iter<'a> {
    threads: &'a ThreadTable,
    next: Option<ThreadId>,
}

impl Iterator for Iter<'_> {
    type Item = ThreadId;

    fn next(&mut self) -> Option<ThreadId> {
        let id = self.next?;
        self.next = self.threads.tcb(id).rq_entry.next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ThreadControlBlock, ThreadFlags};
    use std::vec::Vec;

    fn table_with(n: usize) -> ThreadTable {
        let mut table = ThreadTable::new();
        for i in 0..n {
            table.insert(ThreadControlBlock::new(
                ThreadId::new(i),
                0,
                ThreadFlags::empty(),
                core::ptr::null_mut(),
                0,
                0,
                "t",
            ));
        }
        table
    }

    fn ids(list: &ThreadList, table: &ThreadTable) -> Vec<usize> {
        list.iter(table).map(|id| id.index()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut table = table_with(4);
        let mut list = ThreadList::new();
        for i in [2, 0, 3] {
            list.push_back(&mut table, ThreadId::new(i));
        }
        assert_eq!(list.len(), 3);
        assert_eq!(ids(&list, &table), [2, 0, 3]);
        assert_eq!(list.pop_front(&mut table), Some(ThreadId::new(2)));
        assert_eq!(list.pop_front(&mut table), Some(ThreadId::new(0)));
        assert_eq!(list.pop_front(&mut table), Some(ThreadId::new(3)));
        assert_eq!(list.pop_front(&mut table), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut table = table_with(5);
        let mut list = ThreadList::new();
        for i in 0..5 {
            list.push_back(&mut table, ThreadId::new(i));
        }
        assert!(list.remove(&mut table, ThreadId::new(2)));
        assert_eq!(ids(&list, &table), [0, 1, 3, 4]);
        assert!(list.remove(&mut table, ThreadId::new(0)));
        assert!(list.remove(&mut table, ThreadId::new(4)));
        assert_eq!(ids(&list, &table), [1, 3]);
        assert_eq!(list.front(), Some(ThreadId::new(1)));

        // Removed threads can be linked again.
        list.push_back(&mut table, ThreadId::new(2));
        assert_eq!(ids(&list, &table), [1, 3, 2]);
    }

    #[test]
    fn test_remove_non_member() {
        let mut table = table_with(3);
        let mut a = ThreadList::new();
        let mut b = ThreadList::new();
        a.push_back(&mut table, ThreadId::new(0));
        b.push_back(&mut table, ThreadId::new(1));
        assert!(!a.remove(&mut table, ThreadId::new(1)));
        assert!(!a.remove(&mut table, ThreadId::new(2)));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
