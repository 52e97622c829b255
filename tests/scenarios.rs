//! End-to-end scheduling scenarios on the host port.

use std::task::Poll;

use rtcore::arch::sim::Simulated;
use rtcore::config::{IsrReschedule, MAX_THREADS, PRIORITY_LEVELS};
use rtcore::{
    kernel, KernelError, Msg, Mutex, Scheduler, SchedulerConfig, ThreadFlags, ThreadId,
    ThreadState,
};

extern "C" fn body(_arg: usize) {}

fn leak(size: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; size].into_boxed_slice())
}

fn spawn(s: &mut Scheduler<Simulated>, prio: u8, name: &'static str) -> ThreadId {
    s.thread_create(leak(512), prio, ThreadFlags::empty(), body, 0, name)
        .expect("thread table has room")
}

fn boot(config: SchedulerConfig) -> Scheduler<Simulated> {
    let mut s = Scheduler::with_config(Simulated::new(), config);
    spawn(&mut s, (PRIORITY_LEVELS - 1) as u8, "idle");
    s
}

/// No thread may run while a more urgent one is runnable.
fn assert_priority_invariant(s: &Scheduler<Simulated>) {
    let running = s.current().expect("a thread is running");
    let running_prio = s.priority(running).unwrap();
    assert_eq!(s.state(running), Some(ThreadState::Running));
    for i in 0..MAX_THREADS {
        let id = ThreadId::new(i);
        if let Some(ThreadState::Pending) = s.state(id) {
            assert!(
                s.priority(id).unwrap() >= running_prio,
                "thread {} outranks running thread {}",
                id,
                running
            );
        }
    }
}

#[test]
fn urgent_first_then_equal_priority_in_creation_order() {
    let mut s = boot(SchedulerConfig::default());
    let p1 = spawn(&mut s, 1, "p1");
    let p2a = spawn(&mut s, 2, "p2a");
    let p2b = spawn(&mut s, 2, "p2b");
    s.start();

    let mut trace = vec![s.current().unwrap()];
    s.exit_current();
    trace.push(s.current().unwrap());
    // p2a blocks; p2b takes over until p2a is readied and p2b yields.
    s.sleep(1);
    trace.push(s.current().unwrap());
    s.tick();
    assert_eq!(s.current(), Some(p2b));
    s.yield_now();
    trace.push(s.current().unwrap());

    assert_eq!(trace, [p1, p2a, p2b, p2a]);
    assert_priority_invariant(&s);
}

#[test]
fn mutex_unlock_hands_off_to_urgent_waiter() {
    let mut s = boot(SchedulerConfig::default());
    s.start();
    let lock = Mutex::new();

    let a = spawn(&mut s, 5, "a");
    assert_eq!(lock.lock(&mut s), Poll::Ready(()));
    let b = spawn(&mut s, 2, "b");
    assert_eq!(lock.lock(&mut s), Poll::Pending);
    assert_eq!(s.state(b), Some(ThreadState::BlockedMutex));
    spawn(&mut s, 5, "c");
    assert_eq!(s.current(), Some(a));

    lock.unlock(&mut s);
    assert_eq!(s.current(), Some(b));
    assert_eq!(lock.owner(), Some(b));
    assert_priority_invariant(&s);

    lock.unlock(&mut s);
    assert!(!lock.is_locked());
    assert_eq!(lock.waiters(), 0);
}

#[test]
fn time_slices_rotate_equal_priorities_fairly() {
    let mut s = boot(SchedulerConfig::round_robin(1));
    let ids = [spawn(&mut s, 4, "a"), spawn(&mut s, 4, "b"), spawn(&mut s, 4, "c")];
    spawn(&mut s, 9, "background");
    s.start();

    let mut runs = [0u32; 3];
    for _ in 0..30 {
        let cur = s.current().unwrap();
        let slot = ids.iter().position(|id| *id == cur).expect("only p4 threads run");
        runs[slot] += 1;
        s.enter_isr();
        s.tick();
        s.exit_isr();
        assert_priority_invariant(&s);
    }
    assert_eq!(runs, [10, 10, 10]);
}

#[test]
fn immediate_isr_policy_switches_inside_handler() {
    let config = SchedulerConfig {
        time_slice: None,
        isr_reschedule: IsrReschedule::Immediate,
    };
    let mut s = boot(config);
    let worker = spawn(&mut s, 6, "worker");
    let driver = s
        .thread_create(leak(512), 1, ThreadFlags::SLEEPING, body, 0, "driver")
        .unwrap();
    s.start();
    assert_eq!(s.current(), Some(worker));

    s.enter_isr();
    s.wakeup(driver).unwrap();
    assert_eq!(s.current(), Some(driver));
    assert!(!s.reschedule_pending());
    s.exit_isr();
    assert_priority_invariant(&s);
}

#[test]
fn queued_producer_consumer() {
    let mut s = boot(SchedulerConfig::default());
    let consumer = spawn(&mut s, 3, "consumer");
    s.msg_init_queue(consumer, 4).unwrap();
    let producer = spawn(&mut s, 5, "producer");
    s.start();

    // The consumer waits; each send readies it and it preempts the producer.
    let mut received = Vec::new();
    assert_eq!(s.msg_receive(), Poll::Pending);
    for n in 0..3 {
        assert_eq!(s.current(), Some(producer));
        assert_eq!(s.msg_send(consumer, Msg::new(1, n)), Ok(Poll::Ready(())));
        assert_eq!(s.current(), Some(consumer));
        let msg = s.msg_take().unwrap();
        assert_eq!(msg.sender, Some(producer));
        received.push(msg.content);
        assert_eq!(s.msg_receive(), Poll::Pending);
    }
    assert_eq!(received, [0, 1, 2]);

    // While the consumer sleeps, its queue absorbs a burst.
    assert_eq!(s.msg_send(consumer, Msg::new(1, 3)), Ok(Poll::Ready(())));
    assert_eq!(s.current(), Some(consumer));
    assert_eq!(s.msg_take().map(|m| m.content), Ok(3));
    s.sleep(5);
    assert_eq!(s.current(), Some(producer));
    for n in 10..13 {
        assert_eq!(s.msg_send(consumer, Msg::new(1, n)), Ok(Poll::Ready(())));
    }
    assert_eq!(s.msg_queued(consumer), Some(3));
    for _ in 0..5 {
        s.tick();
    }
    assert_eq!(s.current(), Some(consumer));
    let burst: Vec<_> = (0..3)
        .map(|_| s.msg_try_receive().map(|m| m.content))
        .collect();
    assert_eq!(burst, [Ok(10), Ok(11), Ok(12)]);
}

#[test]
#[should_panic(expected = "stack overflow")]
fn stack_pointer_below_base_is_fatal_at_switch() {
    let mut s = boot(SchedulerConfig::default());
    let a = spawn(&mut s, 3, "a");
    spawn(&mut s, 3, "b");
    s.start();

    let base = s.thread(a).unwrap().stack_base();
    s.port_mut().set_stack_pointer(base - 4);
    s.yield_now();
}

#[test]
fn resource_exhaustion_is_recoverable() {
    let mut s = boot(SchedulerConfig::default());
    for _ in 1..MAX_THREADS {
        spawn(&mut s, 7, "filler");
    }
    let err = s
        .thread_create(leak(512), 7, ThreadFlags::empty(), body, 0, "extra")
        .unwrap_err();
    assert_eq!(err, KernelError::TableFull);
    assert!(err.errno() < 0);
}

/// The only test touching the global kernel instance.
#[test]
fn global_kernel_lifecycle() {
    static LOCK: Mutex = Mutex::new();

    assert!(!kernel::is_initialized());
    kernel::tick();

    let idle = kernel::init(SchedulerConfig::default()).unwrap();
    assert_eq!(
        kernel::init(SchedulerConfig::default()),
        Err(KernelError::InvalidState)
    );
    let worker = kernel::thread_create(leak(512), 5, ThreadFlags::empty(), body, 0, "worker")
        .unwrap();
    let driver = kernel::thread_create(leak(512), 1, ThreadFlags::SLEEPING, body, 0, "driver")
        .unwrap();
    assert_eq!(kernel::start(), worker);

    // An interrupt wakes the driver; the switch waits for the handler to end.
    kernel::isr(|| {
        kernel::thread_wakeup(driver).unwrap();
        assert_eq!(kernel::thread_current(), Some(worker));
    });
    assert_eq!(kernel::thread_current(), Some(driver));

    kernel::thread_sleep(2).unwrap();
    assert_eq!(kernel::thread_current(), Some(worker));
    kernel::tick();
    kernel::tick();
    assert_eq!(kernel::thread_current(), Some(driver));

    assert!(kernel::mutex_trylock(&LOCK));
    assert_eq!(LOCK.owner(), Some(driver));
    kernel::mutex_unlock(&LOCK);
    assert_eq!(
        kernel::isr(|| kernel::mutex_lock(&LOCK)),
        Err(KernelError::InInterrupt)
    );

    assert_eq!(
        kernel::msg_try_send(idle, Msg::new(9, 0)),
        Err(KernelError::WouldBlock)
    );
    kernel::msg_init_queue(idle, 2).unwrap();
    assert_eq!(kernel::msg_try_send(idle, Msg::new(9, 1)), Ok(()));
    assert_eq!(kernel::isr(kernel::msg_receive), Err(KernelError::InInterrupt));

    assert_eq!(kernel::isr(kernel::thread_yield), Err(KernelError::InInterrupt));
    assert_eq!(kernel::thread_stop(idle), Err(KernelError::InvalidState));
    assert_eq!(
        kernel::thread_set_priority(idle, 3),
        Err(KernelError::InvalidState)
    );

    kernel::thread_set_priority(worker, 0).unwrap();
    assert_eq!(kernel::thread_current(), Some(worker));
    assert_eq!(kernel::thread_stop(driver), Ok(()));
    assert_eq!(kernel::thread_resume(driver), Ok(()));
    assert_eq!(kernel::thread_current(), Some(worker));
}
