//! Host port.
//!
//! There is no second CPU context to jump into on a host, so this port
//! performs all of a switch except the jump: it writes real initial frames
//! into thread stacks, moves a simulated stack pointer down by
//! [`Simulated::FRAME_SIZE`] when a thread is switched out and back up when
//! one is resumed, and counts completed switches. The scheduler sees
//! exactly the stack-pointer traffic a hardware port would produce.

use core::mem::size_of;

use super::Context;
use crate::thread::{ThreadEntry, ThreadReturn};

/// Marker stored in the last word of every simulated frame.
pub const FRAME_MAGIC: usize = 0x5157_1C0D;

/// Layout of a simulated saved context, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFrame {
    pub pc: usize,
    pub arg: usize,
    pub lr: usize,
    pub magic: usize,
}

#[derive(Debug, Default)]
pub struct Simulated {
    sp: Option<usize>,
    switches: u32,
}

impl Simulated {
    pub const fn new() -> Self {
        Self {
            sp: None,
            switches: 0,
        }
    }

    /// Completed context switches, including the first start.
    pub fn switches(&self) -> u32 {
        self.switches
    }

    /// Simulated stack pointer of the thread on the CPU.
    pub fn stack_pointer(&self) -> Option<usize> {
        self.sp
    }

    /// Move the live stack pointer, as a running thread's calls would.
    pub fn set_stack_pointer(&mut self, sp: usize) {
        self.sp = Some(sp);
    }

    /// Decode the frame `initial_context` wrote at `offset` into `stack`.
    pub fn frame_at(stack: &[u8], offset: usize) -> SimFrame {
        let word = |i: usize| {
            let start = offset + i * size_of::<usize>();
            let mut bytes = [0u8; size_of::<usize>()];
            bytes.copy_from_slice(&stack[start..start + size_of::<usize>()]);
            usize::from_ne_bytes(bytes)
        };
        SimFrame {
            pc: word(0),
            arg: word(1),
            lr: word(2),
            magic: word(3),
        }
    }
}

impl Context for Simulated {
    const FRAME_SIZE: usize = size_of::<SimFrame>();

    fn initial_context(
        stack: &mut [u8],
        entry: ThreadEntry,
        arg: usize,
        on_return: ThreadReturn,
    ) -> usize {
        let base = stack.as_ptr() as usize;
        let top = (base + stack.len()) & !(size_of::<usize>() * 2 - 1);
        let offset = top - Self::FRAME_SIZE - base;

        let words = [entry as usize, arg, on_return as usize, FRAME_MAGIC];
        for (i, w) in words.iter().enumerate() {
            let start = offset + i * size_of::<usize>();
            stack[start..start + size_of::<usize>()].copy_from_slice(&w.to_ne_bytes());
        }
        base + offset
    }

    fn request_switch(&mut self) -> Option<usize> {
        let sp = self.sp?.wrapping_sub(Self::FRAME_SIZE);
        self.sp = Some(sp);
        Some(sp)
    }

    fn resume(&mut self, sp: usize) {
        self.sp = Some(sp + Self::FRAME_SIZE);
        self.switches += 1;
    }
}
