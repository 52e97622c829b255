//! # Kernel
//!
//! The global kernel instance and the thread-facing API.
//!
//! [`Scheduler`] is a plain value; this module owns the one instance the
//! firmware runs on and wraps every call in the interrupt-disabling
//! critical section. Threads and ISRs call these functions; tests can
//! drive a `Scheduler` directly instead.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()           ← scheduler + idle thread
//!         ├─► kernel::thread_create()  ← application threads (×N)
//!         └─► kernel::start()          ← does not return
//!               ├─► Configure SysTick
//!               ├─► Set PendSV/SysTick priorities
//!               └─► Jump into the most urgent thread
//! ```
//!
//! ## Blocking calls
//!
//! A call that blocks returns from the critical section with the switch
//! pended. PendSV fires as soon as interrupts are enabled again and the
//! thread resumes right there once it is readied; the wrapper then
//! collects the outcome (message, reply, send status).

use core::cell::RefCell;
use core::task::Poll;

use critical_section::Mutex as CsMutex;

use crate::arch::DefaultContext;
use crate::config::{SchedulerConfig, IDLE_PRIORITY, IDLE_STACK_SIZE};
use crate::error::{fatal, Fatal, KernelError, KernelResult};
use crate::irq;
use crate::scheduler::Scheduler;
use crate::sync::{Msg, Mutex};
use crate::thread::{ThreadEntry, ThreadFlags, ThreadId};

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

static KERNEL: CsMutex<RefCell<Option<Scheduler<DefaultContext>>>> =
    CsMutex::new(RefCell::new(None));

/// Run `f` on the global scheduler inside the critical section.
///
/// Using the kernel before [`init`] is fatal.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler<DefaultContext>) -> R) -> R {
    irq::free(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        let sched = kernel.as_mut().unwrap_or_else(|| fatal(Fatal::NotStarted));
        f(sched)
    })
}

pub fn is_initialized() -> bool {
    irq::free(|cs| KERNEL.borrow_ref(cs).is_some())
}

// ---------------------------------------------------------------------------
// Initialization and startup
// ---------------------------------------------------------------------------

/// Create the global scheduler and its idle thread. Returns the idle
/// thread's id. A second call fails with `InvalidState`.
pub fn init(config: SchedulerConfig) -> KernelResult<ThreadId> {
    let stack = crate::static_stack!(IDLE_STACK_SIZE).ok_or(KernelError::InvalidState)?;

    irq::free(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        let mut sched = Scheduler::with_config(DefaultContext::new(), config);
        let idle = sched.thread_create(
            stack,
            IDLE_PRIORITY,
            ThreadFlags::WITHOUT_YIELD | ThreadFlags::STACKTEST,
            idle_thread,
            0,
            "idle",
        )?;
        *kernel = Some(sched);
        log::info!(
            "rtcore initialized: idle thread {}, time slice {:?}",
            idle,
            config.time_slice
        );
        Ok(idle)
    })
}

extern "C" fn idle_thread(_arg: usize) {
    loop {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        cortex_m::asm::wfi();
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        core::hint::spin_loop();
    }
}

/// Start the scheduler and jump into the most urgent thread. **Does not
/// return.**
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m4;

    cortex_m::interrupt::disable();
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    cortex_m4::set_interrupt_priorities(&mut core_peripherals.SCB);

    let first_sp = with_scheduler(|s| s.start());
    log::info!("scheduler started");
    unsafe { cortex_m4::start_first_thread(first_sp) }
}

/// Start the scheduler. On the host port there is no thread to jump
/// into; the call only selects the first thread.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub fn start() -> ThreadId {
    with_scheduler(|s| {
        s.start();
        s.current().unwrap_or_else(|| fatal(Fatal::NotStarted))
    })
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

pub fn thread_create(
    stack: &'static mut [u8],
    priority: u8,
    flags: ThreadFlags,
    entry: ThreadEntry,
    arg: usize,
    name: &'static str,
) -> KernelResult<ThreadId> {
    with_scheduler(|s| s.thread_create(stack, priority, flags, entry, arg, name))
}

pub fn thread_current() -> Option<ThreadId> {
    with_scheduler(|s| s.current())
}

pub fn thread_yield() -> KernelResult<()> {
    with_scheduler(|s| {
        if s.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        s.yield_now();
        Ok(())
    })
}

/// Sleep for `ticks` ticks of `TICK_HZ`.
pub fn thread_sleep(ticks: u32) -> KernelResult<()> {
    with_scheduler(|s| {
        if s.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        s.sleep(ticks);
        Ok(())
    })
}

pub fn thread_sleep_forever() -> KernelResult<()> {
    with_scheduler(|s| {
        if s.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        s.sleep_forever();
        Ok(())
    })
}

/// Wake a sleeping thread. Safe from interrupt handlers: the switch, if
/// any, happens at interrupt exit.
pub fn thread_wakeup(id: ThreadId) -> KernelResult<()> {
    with_scheduler(|s| s.wakeup(id))
}

pub fn thread_stop(id: ThreadId) -> KernelResult<()> {
    with_scheduler(|s| s.stop(id))
}

pub fn thread_resume(id: ThreadId) -> KernelResult<()> {
    with_scheduler(|s| s.resume(id))
}

pub fn thread_set_priority(id: ThreadId, priority: u8) -> KernelResult<()> {
    with_scheduler(|s| s.set_priority(id, priority))
}

/// Terminate the calling thread. An interrupt handler has no thread to
/// terminate; calling this from one is fatal.
pub fn thread_exit() -> ! {
    with_scheduler(|s| {
        if s.in_isr() {
            fatal(Fatal::ExitInInterrupt);
        }
        s.exit_current();
    });
    // The pended switch fires once interrupts are enabled again and never
    // comes back to this stack.
    loop {
        core::hint::spin_loop();
    }
}

/// Return address of every thread's entry function.
pub(crate) extern "C" fn thread_return() -> ! {
    thread_exit()
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Lock `mutex`, blocking until it is handed over.
pub fn mutex_lock(mutex: &Mutex) -> KernelResult<()> {
    with_scheduler(|s| {
        if s.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        // On `Pending` ownership has already been arranged for the moment
        // this thread runs again.
        let _ = mutex.lock(s);
        Ok(())
    })
}

pub fn mutex_trylock(mutex: &Mutex) -> bool {
    with_scheduler(|s| !s.in_isr() && mutex.try_lock(s))
}

pub fn mutex_unlock(mutex: &Mutex) {
    with_scheduler(|s| mutex.unlock(s));
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Give `id` a message queue of `capacity` entries.
pub fn msg_init_queue(id: ThreadId, capacity: usize) -> KernelResult<()> {
    with_scheduler(|s| s.msg_init_queue(id, capacity))
}

/// Send `msg`, blocking until `target` takes it. From an ISR this never
/// blocks and fails with `WouldBlock` instead.
pub fn msg_send(target: ThreadId, msg: Msg) -> KernelResult<()> {
    match with_scheduler(|s| s.msg_send(target, msg))? {
        Poll::Ready(()) => Ok(()),
        Poll::Pending => with_scheduler(|s| s.msg_send_status()),
    }
}

pub fn msg_try_send(target: ThreadId, msg: Msg) -> KernelResult<()> {
    with_scheduler(|s| s.msg_try_send(target, msg))
}

pub fn msg_receive() -> KernelResult<Msg> {
    let polled = with_scheduler(|s| {
        if s.in_isr() {
            return Err(KernelError::InInterrupt);
        }
        Ok(s.msg_receive())
    })?;
    match polled {
        Poll::Ready(msg) => Ok(msg),
        Poll::Pending => with_scheduler(|s| s.msg_take()),
    }
}

pub fn msg_try_receive() -> KernelResult<Msg> {
    with_scheduler(|s| s.msg_try_receive())
}

/// Send `msg` to `target` and block until it replies.
pub fn msg_send_receive(target: ThreadId, msg: Msg) -> KernelResult<Msg> {
    with_scheduler(|s| s.msg_send_receive(target, msg))?;
    with_scheduler(|s| s.msg_take())
}

pub fn msg_reply(received: &Msg, reply: Msg) -> KernelResult<()> {
    with_scheduler(|s| s.msg_reply(received, reply))
}

// ---------------------------------------------------------------------------
// Interrupt integration
// ---------------------------------------------------------------------------

/// Run an interrupt handler body that may call into the kernel. Switches
/// requested inside are performed when the outermost handler exits.
pub fn isr<R>(f: impl FnOnce() -> R) -> R {
    with_scheduler(|s| s.enter_isr());
    let r = f();
    with_scheduler(|s| s.exit_isr());
    r
}

/// Periodic tick, called from the timer interrupt. Ignored before
/// [`init`].
pub fn tick() {
    irq::free(|cs| {
        if let Some(s) = KERNEL.borrow_ref_mut(cs).as_mut() {
            s.enter_isr();
            s.tick();
            s.exit_isr();
        }
    });
}

/// Switch half of PendSV: trade the outgoing PSP for the incoming one.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub(crate) fn switch_stacks(saved_psp: usize) -> usize {
    with_scheduler(|s| s.switch_stacks(Some(saved_psp)))
}
