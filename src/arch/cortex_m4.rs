//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and interrupt priority setup.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR
//! onto the process stack. The PendSV handler saves and restores R4–R11,
//! which completes the context. A scheduler decision only pends PendSV;
//! since PendSV has the lowest priority, the switch happens once every
//! other handler has returned, never in the middle of an ISR.
//!
//! Threads must not use the FPU: handlers return with `EXC_RETURN =
//! 0xFFFF_FFFD` (basic frame).

use core::arch::{asm, naked_asm};
use core::mem::size_of;

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use super::Context;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::thread::{ThreadEntry, ThreadReturn};

/// Words in a full saved context: 8 software-saved (R4–R11) followed by
/// the 8-word hardware exception frame.
const FRAME_WORDS: usize = 16;

/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 0x0100_0000;

pub struct CortexM4;

impl CortexM4 {
    pub const fn new() -> Self {
        Self
    }
}

impl Context for CortexM4 {
    const FRAME_SIZE: usize = FRAME_WORDS * size_of::<u32>();

    /// ## Stack Layout (top = high address, growing down)
    ///
    /// ```text
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (entry)
    ///   LR    (on_return)
    ///   R12, R3, R2, R1  (0)
    ///   R0    (arg)
    /// [Software saved context]
    ///   R11 … R4 (0)             <- returned stack pointer
    /// ```
    fn initial_context(
        stack: &mut [u8],
        entry: ThreadEntry,
        arg: usize,
        on_return: ThreadReturn,
    ) -> usize {
        let base = stack.as_ptr() as usize;
        // Align to 8 bytes (AAPCS requirement)
        let top = (base + stack.len()) & !0x07;
        let offset = top - Self::FRAME_SIZE - base;

        let mut frame = [0u32; FRAME_WORDS];
        frame[8] = arg as u32; // R0
        frame[13] = on_return as usize as u32; // LR
        frame[14] = entry as usize as u32 & !1; // PC, halfword aligned for exception return
        frame[15] = XPSR_THUMB;

        for (i, word) in frame.iter().enumerate() {
            let start = offset + i * size_of::<u32>();
            stack[start..start + size_of::<u32>()].copy_from_slice(&word.to_ne_bytes());
        }
        base + offset
    }

    fn request_switch(&mut self) -> Option<usize> {
        SCB::set_pendsv();
        None
    }

    fn resume(&mut self, _sp: usize) {
        // PendSV restores the new context itself.
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest priority, so a context switch
/// never preempts an application ISR.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// First thread launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and jump into the thread whose initial
/// frame sits at `psp`.
///
/// # Safety
/// Must only be called once, with interrupts disabled, with a stack
/// pointer produced by `initial_context`.
pub unsafe fn start_first_thread(psp: usize) -> ! {
    unsafe {
        asm!(
            "adds r0, #32",          // Skip the 8 software-saved registers
            "msr psp, r0",
            "movs r0, #2",           // CONTROL.SPSEL = 1: Thread mode uses PSP
            "msr control, r0",
            "isb",
            "pop {{r0-r3, r12}}",    // R0 (arg) … R12
            "pop {{r4}}",            // LR
            "pop {{r5}}",            // PC
            "pop {{r6}}",            // xPSR, discarded
            "mov lr, r4",
            "orr r5, r5, #1",        // bx needs the Thumb bit
            "cpsie i",
            "bx r5",
            in("r0") psp,
            options(noreturn)
        );
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the actual context switch.
///
/// 1. Push R4–R11 onto the outgoing thread's stack (PSP)
/// 2. Hand the resulting PSP to the scheduler, get the next thread's PSP
/// 3. Pop R4–R11 from the new stack and return to Thread mode on PSP
///
/// # Safety
/// Naked function entered by the NVIC.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",             // r0 = switch_stacks(r0)
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "ldr r0, =0xFFFFFFFD",     // Return to Thread mode, PSP, basic frame
        "bx r0",
        switch = sym switch_stacks,
    );
}

extern "C" fn switch_stacks(saved_psp: usize) -> usize {
    crate::kernel::switch_stacks(saved_psp)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: scheduler tick entry point.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::kernel::tick();
}
