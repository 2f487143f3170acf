//! Test fixtures for exercising the scheduler without a port
use core::{cell::Cell, ptr::NonNull};
use std::thread_local;

use crate::{
    klock,
    sched::Scheduler,
    thread::{Priority, ThreadCb, ThreadId},
    utils::Arena,
    wait::QueueId,
    ClockEnableError, ClockInfo, Kernel, KernelCfg, PrepareStackError, ThreadStart, PRIO_DEFAULT,
};

thread_local! {
    static CPU_LOCK: Cell<bool> = Cell::new(false);
}

/// A port that never switches contexts. CPU Lock is tracked per test thread.
pub(crate) struct NullPort;

unsafe impl crate::Port for NullPort {
    type Context = ();

    fn prepare_stack(_: &mut [u8], _: ThreadStart<Self>) -> Result<(), PrepareStackError> {
        Ok(())
    }

    unsafe fn switch_context(_: NonNull<()>, _: NonNull<()>) {
        unreachable!("NullPort can't switch contexts")
    }

    unsafe fn dispatch_first_thread(_: NonNull<()>) {
        unreachable!("NullPort can't dispatch threads")
    }

    unsafe fn exit_and_dispatch(_: NonNull<()>, _: NonNull<()>) -> ! {
        unreachable!("NullPort can't dispatch threads")
    }

    unsafe fn try_enter_cpu_lock() -> bool {
        !CPU_LOCK.with(|l| l.replace(true))
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.with(|l| l.set(false));
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.with(Cell::get)
    }

    fn wait_for_interrupt() {}

    fn clock_enable(clock: &ClockInfo) -> Result<(), ClockEnableError> {
        if clock.name == "broken" {
            Err(ClockEnableError::BadObjectState)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn noop(_: &'static Kernel<NullPort>, _: usize) {}

pub(crate) fn scheduler() -> Scheduler<NullPort> {
    scheduler_with(KernelCfg::new())
}

pub(crate) fn scheduler_with(cfg: KernelCfg) -> Scheduler<NullPort> {
    let _ = env_logger::builder().is_test(true).try_init();
    Scheduler::new(&cfg)
}

/// Add a runnable thread. The first one should be passed to
/// `dispatch_first`.
pub(crate) fn spawn(sched: &mut Scheduler<NullPort>, name: &str, priority: Priority) -> ThreadId {
    let join_queue = sched.create_queue();
    let mut cb = ThreadCb::new(Default::default(), priority, noop, 0, join_queue);
    cb.name.push_str(name);
    let thread = sched.threads.insert(cb);
    sched.make_runnable(thread);
    thread
}

/// Advance the system clock by `ticks` and process the expired timers.
pub(crate) fn advance(sched: &mut Scheduler<NullPort>, ticks: u32) {
    for _ in 0..ticks {
        sched.clocks[0].tick();
    }
    sched.update_clocks();
}

/// A detached control block for exercising the run queue directly.
pub(crate) fn thread_cb(priority: Priority) -> ThreadCb<NullPort> {
    let mut queues = Arena::<QueueId, ()>::new();
    ThreadCb::new(Default::default(), priority, noop, 0, queues.insert(()))
}

/// A leaked kernel whose current thread is `main`. Enough for operations
/// that don't block.
pub(crate) fn kernel() -> (&'static Kernel<NullPort>, ThreadId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel: &'static Kernel<NullPort> = Box::leak(Box::new(Kernel::new(KernelCfg::new())));
    let mut lock = klock::lock_cpu::<NullPort>().unwrap();
    let sched = kernel.state.write(&mut *lock);
    let main = spawn(sched, "main", PRIO_DEFAULT);
    sched.dispatch_first(main);
    (kernel, main)
}
