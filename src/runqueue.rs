//! # Run Queue
//!
//! One FIFO of PENDING threads per priority level, plus a bitmap with bit
//! `p` set iff level `p` is non-empty. The most urgent non-empty level is
//! the bitmap's lowest set bit, so selection is O(1) regardless of how many
//! threads are queued.
//!
//! ```text
//!  bitmap: 0b0000_0000_0010_0101
//!               level 0 ─► [t3]
//!               level 2 ─► [t1] ─► [t4] ─► [t0]
//!               level 5 ─► [t7]
//! ```

use crate::config::PRIORITY_LEVELS;
use crate::list::ThreadList;
use crate::thread::{ThreadId, ThreadTable};

pub struct RunQueue {
    levels: [ThreadList; PRIORITY_LEVELS],
    bitmap: u32,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            levels: [ThreadList::new(); PRIORITY_LEVELS],
            bitmap: 0,
        }
    }

    /// Append `id` to the tail of level `prio`.
    pub fn push_back(&mut self, threads: &mut ThreadTable, id: ThreadId, prio: u8) {
        self.levels[prio as usize].push_back(threads, id);
        self.bitmap |= 1 << prio;
    }

    /// Take the head of level `prio`.
    pub fn pop_front(&mut self, threads: &mut ThreadTable, prio: u8) -> Option<ThreadId> {
        let level = &mut self.levels[prio as usize];
        let id = level.pop_front(threads)?;
        if level.is_empty() {
            self.bitmap &= !(1 << prio);
        }
        Some(id)
    }

    /// Unlink `id` from level `prio`; clears the level's bit if it empties.
    pub fn remove(&mut self, threads: &mut ThreadTable, id: ThreadId, prio: u8) -> bool {
        let level = &mut self.levels[prio as usize];
        let removed = level.remove(threads, id);
        if level.is_empty() {
            self.bitmap &= !(1 << prio);
        }
        removed
    }

    /// Most urgent non-empty level.
    #[inline]
    pub fn highest_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as u8)
        }
    }

    #[inline]
    pub fn is_level_empty(&self, prio: u8) -> bool {
        self.bitmap & (1 << prio) == 0
    }

    pub fn level(&self, prio: u8) -> &ThreadList {
        &self.levels[prio as usize]
    }

    #[inline]
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Total number of queued threads.
    pub fn len(&self) -> usize {
        self.levels.iter().map(ThreadList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
