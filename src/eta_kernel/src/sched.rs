//! The scheduler core
//!
//! [`Scheduler`] holds every piece of mutable kernel state and implements
//! the scheduling decisions as plain state transitions, without touching the
//! processor. [`Kernel`] wraps it in CPU Lock and carries out the context
//! switches it decides on.
use alloc::vec::Vec;
use core::mem;

use crate::{
    cfg::KernelCfg,
    clock::{ClockId, ClockInfo, ClockSource},
    klock,
    thread::{RunState, ThreadId},
    timer::{TimerCallback, TimerCb, TimerId},
    utils::Arena,
    wait::{QueueCb, QueueId},
    Kernel, Port,
};

mod runqueue;

pub use self::runqueue::SchedPolicy;
pub(crate) use self::runqueue::{
    list_insert, list_iter, list_remove, RunQueue, SchedClass, Threads,
};

/// The outcome of [`Scheduler::pick_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleDecision {
    /// The current thread keeps running.
    Keep,
    /// `to` is now the current thread. The caller must switch contexts.
    SwitchTo { from: ThreadId, to: ThreadId },
}

/// The kernel state.
pub(crate) struct Scheduler<P: Port> {
    pub(crate) threads: Threads<P>,
    pub(crate) queues: Arena<QueueId, QueueCb>,
    pub(crate) timers: Arena<TimerId, TimerCb<P>>,
    pub(crate) clocks: Vec<ClockSource>,
    pub(crate) rq: RunQueue,

    pub(crate) current: Option<ThreadId>,
    pub(crate) idle: Option<ThreadId>,

    pub(crate) policy: SchedPolicy,
    pub(crate) time_slice: u32,
    pub(crate) sys_clock: ClockId,

    /// Callbacks of expired timers, to be run outside CPU Lock.
    pub(crate) expired: Vec<(TimerCallback<P>, usize)>,

    rng: u32,
}

impl<P: Port> Scheduler<P> {
    pub(crate) fn new(cfg: &KernelCfg) -> Self {
        let mut clocks = Vec::new();
        clocks.push(ClockSource::new(ClockInfo {
            name: "sys",
            freq: cfg.tick_freq,
        }));

        Self {
            threads: Arena::new(),
            queues: Arena::new(),
            timers: Arena::new(),
            clocks,
            rq: RunQueue::default(),
            current: None,
            idle: None,
            policy: cfg.policy,
            time_slice: cfg.time_slice,
            sys_clock: ClockId(0),
            expired: Vec::new(),
            rng: if cfg.lottery_seed == 0 { 1 } else { cfg.lottery_seed },
        }
    }

    /// Get the current thread.
    ///
    /// # Panics
    ///
    /// Panics before the kernel is booted.
    #[track_caller]
    pub(crate) fn current(&self) -> ThreadId {
        match self.current {
            Some(current) => current,
            None => panic!("no current thread"),
        }
    }

    /// Return `true` if `thread` is entitled to preempt the current thread.
    pub(crate) fn should_preempt(&self, thread: ThreadId) -> bool {
        match self.current {
            Some(current) => {
                self.policy
                    .precedes_or_ties(&self.threads[thread], &self.threads[current])
            }
            None => false,
        }
    }

    /// Mark `thread` ready to run. The current thread isn't linked into the
    /// run queue.
    pub(crate) fn make_runnable(&mut self, thread: ThreadId) {
        self.threads[thread].state = RunState::Running;
        if self.current == Some(thread) {
            self.threads[thread].on_rq = true;
        } else {
            let policy = self.policy;
            self.rq.add(&mut self.threads, thread, &policy);
        }
    }

    /// Make a blocked thread runnable, and ask the current thread to yield if
    /// the woken thread ranks at or above it.
    pub(crate) fn wake(&mut self, thread: ThreadId) {
        self.make_runnable(thread);
        if self.current != Some(thread) && self.should_preempt(thread) {
            let current = self.current();
            self.threads[current].need_resched = true;
        }
    }

    /// The yield-point decision: request a reschedule if a ready thread ranks
    /// at or above the current thread. Return `true` if the current thread
    /// should be switched out now.
    pub(crate) fn yield_check(&mut self) -> bool {
        let current = self.current();
        if self.threads[current].preempt_count != 0 {
            return false;
        }
        if let Some(candidate) = self.rq.first_runnable(&self.threads) {
            if self.should_preempt(candidate) {
                self.threads[current].need_resched = true;
            }
        }
        self.threads[current].need_resched
    }

    /// Return `true` if a reschedule was requested and preemption is enabled.
    pub(crate) fn preemption_pending(&self) -> bool {
        let thread = &self.threads[self.current()];
        thread.preempt_count == 0 && thread.need_resched
    }

    /// Decide which thread runs next, and update the bookkeeping for the
    /// switch.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is blocked and nothing else is ready,
    /// which can't happen while the idle thread exists.
    pub(crate) fn pick_next(&mut self) -> ScheduleDecision {
        let current = self.current();
        let need_resched = mem::take(&mut self.threads[current].need_resched);
        let runnable = self.threads[current].state == RunState::Running;
        if !need_resched && runnable {
            return ScheduleDecision::Keep;
        }

        let policy = self.policy;
        let next = match policy.next_runnable(&self.threads, &self.rq, &mut self.rng) {
            Some(next) => next,
            None if runnable => return ScheduleDecision::Keep,
            None => panic!("no runnable thread"),
        };
        debug_assert_ne!(next, current);

        self.rq.remove(&mut self.threads, next);
        policy.dynamic_priority_update(&mut self.threads, &self.rq, next);
        if runnable {
            self.rq.add(&mut self.threads, current, &policy);
        } else {
            self.threads[current].on_rq = false;
        }

        self.current = Some(next);
        self.rq.switch_count += 1;
        policy.post_schedule(&mut self.threads[next], self.time_slice);

        log::trace!("schedule: {:?} -> {:?}", current, next);
        ScheduleDecision::SwitchTo {
            from: current,
            to: next,
        }
    }

    pub(crate) fn preempt_disable(&mut self) {
        let current = self.current();
        self.threads[current].preempt_count += 1;
    }

    /// Return `true` if preemption became enabled with a reschedule pending.
    pub(crate) fn preempt_enable(&mut self) -> bool {
        let current = self.current();
        let thread = &mut self.threads[current];
        thread.preempt_count = match thread.preempt_count.checked_sub(1) {
            Some(x) => x,
            None => panic!("unbalanced preempt_enable"),
        };
        thread.preempt_count == 0 && thread.need_resched
    }

    /// Consume one system tick of the current thread's time slice.
    #[cfg(feature = "preempt")]
    pub(crate) fn tick_slice(&mut self) {
        let time_slice = self.time_slice;
        let Some(current) = self.current else { return };
        let thread = &mut self.threads[current];
        if thread.is_idle {
            return;
        }
        thread.slice = thread.slice.saturating_sub(1);
        if thread.slice == 0 {
            thread.slice = time_slice;
            thread.preempt_need_resched = true;
        }
    }

    /// Consume the time-slice expiry flag. Return `true` if it should lead to
    /// a yield.
    pub(crate) fn take_preempt_request(&mut self) -> bool {
        let current = self.current();
        let thread = &mut self.threads[current];
        thread.preempt_count == 0 && mem::take(&mut thread.preempt_need_resched)
    }

    /// Catch up every clock source with its tick count, firing the timers
    /// that expired in the meantime.
    pub(crate) fn update_clocks(&mut self) {
        for i in 0..self.clocks.len() {
            self.process_clock(ClockId(i));
        }
    }

    /// The common part of every scheduling point: deliver notifications
    /// recorded by interrupt handlers and fire expired timers.
    pub(crate) fn catch_up(&mut self) {
        self.drain_wake_events();
        self.update_clocks();
    }
}

impl<P: Port> Kernel<P> {
    /// Run the scheduler and switch to the chosen thread. Returns when the
    /// calling thread is dispatched again, or right away if it keeps running.
    pub(crate) fn schedule(&'static self, mut lock: klock::CpuLockTokenRefMut<'_, P>) {
        loop {
            let sched = self.state.write(&mut *lock);
            sched.preempt_disable();
            sched.catch_up();

            if let ScheduleDecision::SwitchTo { from, to } = sched.pick_next() {
                let outgoing = sched.context_ptr(from);
                let incoming = sched.context_ptr(to);

                // Safety: CPU Lock active, both contexts are alive. CPU Lock
                // is handed back to us when `from` is dispatched again.
                unsafe { P::switch_context(outgoing, incoming) };
            }

            let sched = self.state.write(&mut *lock);
            let current = sched.current();
            let thread = &mut sched.threads[current];
            thread.preempt_count -= 1;
            if !thread.need_resched {
                break;
            }
        }
    }

    /// Release CPU Lock. Timer callbacks that expired during the operation
    /// run first, and the current thread is switched out if a higher-priority
    /// thread became ready.
    pub(crate) fn unlock_cpu_and_check_preemption(&'static self, lock: klock::CpuLockGuard<P>) {
        self.unlock_cpu(lock, false);
    }

    /// Like [`Self::unlock_cpu_and_check_preemption`], but also a yield
    /// point: a ready thread of equal priority gets to run.
    pub(crate) fn unlock_cpu_and_yield(&'static self, lock: klock::CpuLockGuard<P>) {
        self.unlock_cpu(lock, true);
    }

    fn unlock_cpu(&'static self, mut lock: klock::CpuLockGuard<P>, mut yield_point: bool) {
        loop {
            let sched = self.state.write(&mut *lock);

            if !sched.expired.is_empty() {
                let expired = mem::take(&mut sched.expired);
                drop(lock);
                self.run_timer_callbacks(expired);
                lock = match klock::lock_cpu::<P>() {
                    Ok(lock) => lock,
                    Err(_) => return,
                };
                continue;
            }

            // Interrupt contexts never switch; the epilogue of the outermost
            // handler does.
            if sched.current.is_none() || self.is_interrupt_context() {
                break;
            }

            let resched = if mem::take(&mut yield_point) {
                sched.yield_check()
            } else {
                sched.preemption_pending()
            };
            if !resched {
                break;
            }
            self.schedule(lock.borrow_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn switch_requires_request_or_block() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let other = testing::spawn(&mut sched, "other", 120);

        assert_eq!(sched.pick_next(), ScheduleDecision::Keep);

        sched.threads[main].need_resched = true;
        assert_eq!(
            sched.pick_next(),
            ScheduleDecision::SwitchTo {
                from: main,
                to: other
            }
        );
        assert_eq!(sched.current, Some(other));
        assert_eq!(sched.rq.iter(&sched.threads).collect::<Vec<_>>(), [main]);
        assert_eq!(sched.rq.switch_count, 1);
    }

    #[test]
    fn keep_when_nothing_else_is_ready() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);

        sched.threads[main].need_resched = true;
        assert_eq!(sched.pick_next(), ScheduleDecision::Keep);
        assert!(!sched.threads[main].need_resched);
    }

    #[test]
    #[should_panic(expected = "no runnable thread")]
    fn blocking_with_nothing_ready_panics() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        sched.threads[main].state = RunState::Parked;
        sched.pick_next();
    }

    #[test]
    fn yield_rotates_equal_priority_only() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "lower", 121);
        assert!(!sched.yield_check());

        testing::spawn(&mut sched, "peer", 120);
        assert!(sched.yield_check());
    }

    #[test]
    fn yield_check_respects_preempt_count() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "higher", 10);

        sched.preempt_disable();
        assert!(!sched.yield_check());
        assert!(!sched.preempt_enable());
        assert!(sched.yield_check());
    }

    #[test]
    fn wake_requests_preemption_by_rank() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let low = testing::spawn(&mut sched, "low", 200);
        sched.threads[low].state = RunState::Parked;
        sched.rq.remove(&mut sched.threads, low);

        sched.wake(low);
        assert!(!sched.threads[main].need_resched);

        let high = testing::spawn(&mut sched, "high", 100);
        sched.threads[high].state = RunState::Parked;
        sched.rq.remove(&mut sched.threads, high);
        sched.wake(high);
        assert!(sched.threads[main].need_resched);
        assert_eq!(
            sched.rq.iter(&sched.threads).collect::<Vec<_>>(),
            [high, low]
        );
    }

    #[cfg(feature = "preempt")]
    #[test]
    fn time_slice_expiry() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let slice = sched.time_slice;

        for _ in 1..slice {
            sched.tick_slice();
        }
        assert!(!sched.take_preempt_request());
        sched.tick_slice();
        assert!(sched.take_preempt_request());
        assert_eq!(sched.threads[main].slice, slice);
        assert!(!sched.take_preempt_request());
    }

    #[test]
    fn dynamic_priority_reaches_starved_thread() {
        let mut sched =
            testing::scheduler_with(KernelCfg::new().policy(SchedPolicy::DynamicPriority));
        let a = testing::spawn(&mut sched, "a", 100);
        sched.dispatch_first(a);
        let b = testing::spawn(&mut sched, "b", 100);
        let starved = testing::spawn(&mut sched, "starved", 103);

        // `a` and `b` keep yielding to each other. `starved` ages by one level
        // per switch and eventually overtakes them.
        let mut dispatched = Vec::new();
        for _ in 0..8 {
            let current = sched.current();
            sched.threads[current].need_resched = true;
            if let ScheduleDecision::SwitchTo { to, .. } = sched.pick_next() {
                dispatched.push(to);
            }
        }
        assert!(dispatched.contains(&starved), "{:?}", dispatched);
        assert!(dispatched.contains(&b));
    }
}
