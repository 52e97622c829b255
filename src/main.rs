//! # rtcore Demo Firmware
//!
//! Exercises every kernel service on an STM32F4 (Cortex-M4) board:
//!
//! | Thread | Priority | Behavior |
//! |--------|----------|----------|
//! | `sensor` | 2 | Sleeps 100 ticks, then sends a sample to `logger` |
//! | `logger` | 4 | Receives samples (queue of 4) and asks `stats` to fold them in |
//! | `stats` | 3 | Server: answers `msg_send_receive` requests with a running mean |
//! | `worker_a`, `worker_b` | 6 | Share a counter behind a mutex, yielding to each other |
//! | `idle` | 15 | Created by `kernel::init`, sleeps the core with `wfi` |
//!
//! ## Expected Behavior
//!
//! 1. `stats` and `logger` block in `msg_receive` straight away.
//! 2. The two workers alternate on the mutex; each unlock hands the lock to
//!    the other, which then runs once its peer yields.
//! 3. Every 100 ticks `sensor` wakes, preempts the workers, and its message
//!    readies `logger`, which in turn makes a blocking request to `stats`.
//! 4. Once all are blocked again the workers resume where they left off.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use panic_halt as _;

use rtcore::config::{SchedulerConfig, DEFAULT_TIME_SLICE};
use rtcore::{kernel, static_stack, Msg, Mutex, ThreadFlags, ThreadId};

const MSG_SAMPLE: u16 = 1;
const MSG_FOLD: u16 = 2;
const MSG_MEAN: u16 = 3;

static COUNTER_LOCK: Mutex = Mutex::new();
static mut COUNTER: u32 = 0;

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

/// Periodic producer. `arg` is the logger's thread id.
extern "C" fn sensor(arg: usize) {
    let logger = ThreadId::from_raw(arg);
    let mut sample: usize = 0;
    loop {
        if kernel::thread_sleep(100).is_err() {
            kernel::thread_exit();
        }
        sample = sample.wrapping_mul(31).wrapping_add(17) % 1024;
        // The logger queues up to four samples; past that we wait.
        let _ = kernel::msg_send(logger, Msg::new(MSG_SAMPLE, sample));
    }
}

/// Consumer. `arg` is the stats server's thread id.
extern "C" fn logger(arg: usize) {
    let stats = ThreadId::from_raw(arg);
    loop {
        let Ok(msg) = kernel::msg_receive() else {
            continue;
        };
        if msg.kind != MSG_SAMPLE {
            continue;
        }
        match kernel::msg_send_receive(stats, Msg::new(MSG_FOLD, msg.content)) {
            Ok(reply) => log::info!("sample {} mean {}", msg.content, reply.content),
            Err(e) => log::warn!("stats unavailable: {}", e),
        }
    }
}

/// Request/reply server keeping a running mean.
extern "C" fn stats(_arg: usize) {
    let (mut sum, mut n) = (0usize, 0usize);
    loop {
        let Ok(req) = kernel::msg_receive() else {
            continue;
        };
        sum = sum.wrapping_add(req.content);
        n += 1;
        let _ = kernel::msg_reply(&req, Msg::new(MSG_MEAN, sum / n));
    }
}

extern "C" fn worker(_arg: usize) {
    loop {
        if kernel::mutex_lock(&COUNTER_LOCK).is_ok() {
            // Safety: COUNTER is only touched while holding COUNTER_LOCK.
            unsafe {
                let counter = &mut *core::ptr::addr_of_mut!(COUNTER);
                *counter = counter.wrapping_add(1);
            }
            kernel::mutex_unlock(&COUNTER_LOCK);
        }
        let _ = kernel::thread_yield();
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().expect("core peripherals already taken");

    kernel::init(SchedulerConfig::round_robin(DEFAULT_TIME_SLICE)).expect("kernel init failed");

    let stats_id = kernel::thread_create(
        static_stack!(1024).expect("stats stack"),
        3,
        ThreadFlags::empty(),
        stats,
        0,
        "stats",
    )
    .expect("Failed to create stats");

    let logger_id = kernel::thread_create(
        static_stack!(1024).expect("logger stack"),
        4,
        ThreadFlags::STACKTEST,
        logger,
        stats_id.into_raw(),
        "logger",
    )
    .expect("Failed to create logger");
    kernel::msg_init_queue(logger_id, 4).expect("logger queue");

    kernel::thread_create(
        static_stack!(512).expect("sensor stack"),
        2,
        ThreadFlags::empty(),
        sensor,
        logger_id.into_raw(),
        "sensor",
    )
    .expect("Failed to create sensor");

    for (name, stack) in [
        ("worker_a", static_stack!(512)),
        ("worker_b", static_stack!(512)),
    ] {
        kernel::thread_create(
            stack.expect("worker stack"),
            6,
            ThreadFlags::empty(),
            worker,
            0,
            name,
        )
        .expect("Failed to create worker");
    }

    // Does not return.
    kernel::start(cp)
}
