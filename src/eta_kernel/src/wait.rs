//! Wait queues
//!
//! A wait queue is a list of blocked threads with a latching one-shot event.
//! Its head is one of:
//!
//!  - *empty*: nobody is waiting and no event is pending,
//!  - *signaled*: an event was delivered while nobody was waiting; the next
//!    wait consumes it and returns immediately,
//!  - the first of one or more waiting threads, in scheduling order.
//!
//! Interrupt handlers don't wake threads directly. They increment the event
//! counter (`ec`) of the queue's head thread, and the counter is delivered at
//! the next scheduling point. The counter stays with the head: when the head
//! leaves, its count moves to the new head.
use core::{fmt, mem};

use crate::{
    error::{NotifyError, TimeoutError, WaitError, WaitTimeoutError},
    klock,
    sched::{list_insert, list_remove, Scheduler},
    state,
    thread::{Link, RunState, ThreadId, WaitTimer},
    timer::{TimerAction, TimerId},
    utils::define_key,
    BadContextError, Isr, Kernel, Port,
};

define_key! {
    pub(crate) struct QueueId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueHead {
    Empty,
    Signaled,
    Waiting(ThreadId),
}

/// *Queue control block*
#[derive(Debug)]
pub(crate) struct QueueCb {
    pub(crate) head: QueueHead,
    /// The value of the semaphore built on this queue. Each waiter holds a
    /// reservation of one, which its timeout gives back.
    pub(crate) permits: Option<i32>,
}

/// The outcome of [`Scheduler::wait_begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitBegin {
    /// A pending event was consumed. The thread keeps running.
    Latched,
    /// The thread is blocked. The caller must schedule.
    Blocked,
}

impl<P: Port> Scheduler<P> {
    pub(crate) fn create_queue(&mut self) -> QueueId {
        self.queues.insert(QueueCb {
            head: QueueHead::Empty,
            permits: None,
        })
    }

    pub(crate) fn queue_is_empty(&self, queue: QueueId) -> bool {
        !matches!(self.queues[queue].head, QueueHead::Waiting(_))
    }

    fn queue_waiters(&self, queue: QueueId) -> Option<ThreadId> {
        match self.queues[queue].head {
            QueueHead::Waiting(head) => Some(head),
            QueueHead::Empty | QueueHead::Signaled => None,
        }
    }

    fn set_queue_waiters(&mut self, queue: QueueId, head: Option<ThreadId>) {
        self.queues[queue].head = match head {
            Some(head) => QueueHead::Waiting(head),
            None => QueueHead::Empty,
        };
    }

    /// Link `thread` into `queue` in scheduling order.
    fn queue_insert(&mut self, queue: QueueId, thread: ThreadId) {
        let old_head = self.queue_waiters(queue);
        let mut head = old_head;
        self.threads[thread].ec = 0;
        let policy = self.policy;
        list_insert(&mut self.threads, &mut head, thread, &policy);
        self.threads[thread].link = Link::WaitQueue(queue);

        // The pending count belongs to whoever heads the queue
        if let (Some(old), Some(new)) = (old_head, head) {
            if old != new {
                self.threads[new].ec = mem::take(&mut self.threads[old].ec);
            }
        }
        self.set_queue_waiters(queue, head);
    }

    /// Unlink `thread` from `queue`.
    pub(crate) fn queue_remove(&mut self, queue: QueueId, thread: ThreadId) {
        let mut head = self.queue_waiters(queue);
        let was_head = head == Some(thread);
        let removed = list_remove(&mut self.threads, &mut head, thread);
        debug_assert!(removed, "{:?} is not in {:?}", thread, queue);
        self.threads[thread].link = Link::None;

        let ec = mem::take(&mut self.threads[thread].ec);
        self.set_queue_waiters(queue, head);
        match (was_head, head) {
            (true, Some(new_head)) => self.threads[new_head].ec += ec,
            // Undelivered events outlive the last waiter
            (true, None) if ec > 0 => self.queues[queue].head = QueueHead::Signaled,
            _ => {}
        }
    }

    pub(crate) fn wake_list_remove(&mut self, thread: ThreadId) {
        self.rq.wake_list_remove(&mut self.threads, thread);
    }

    /// Start waiting on `queue` with an optional timeout in system ticks.
    pub(crate) fn wait_begin(&mut self, queue: QueueId, ticks: Option<u32>) -> WaitBegin {
        if self.queues[queue].head == QueueHead::Signaled {
            self.queues[queue].head = QueueHead::Empty;
            return WaitBegin::Latched;
        }

        let current = self.current();
        let timer = match ticks {
            Some(ticks) => WaitTimer::Armed(self.timer_create_internal(
                self.sys_clock,
                ticks,
                TimerAction::WaitTimeout(current),
            )),
            None => WaitTimer::None,
        };

        let thread = &mut self.threads[current];
        thread.timer = timer;
        thread.state = RunState::Waiting;
        thread.on_rq = false;
        thread.need_resched = true;

        self.rq.wake_list_add(&mut self.threads, current);
        self.queue_insert(queue, current);
        log::trace!("{:?} waits on {:?}", current, queue);
        WaitBegin::Blocked
    }

    /// Finish a wait after the current thread resumed. Return `Err` if the
    /// wait timed out.
    pub(crate) fn wait_end(&mut self) -> Result<(), TimeoutError> {
        let current = self.current();
        match mem::replace(&mut self.threads[current].timer, WaitTimer::None) {
            WaitTimer::Expired => Err(TimeoutError::Timeout),
            WaitTimer::None | WaitTimer::Armed(_) => Ok(()),
        }
    }

    /// Deliver one event to `queue`: wake the first waiter, or latch the
    /// event if nobody is waiting.
    pub(crate) fn notify(&mut self, queue: QueueId) {
        match self.queues[queue].head {
            QueueHead::Empty => self.queues[queue].head = QueueHead::Signaled,
            QueueHead::Signaled => {}
            QueueHead::Waiting(head) => self.wake_waiter(queue, head),
        }
    }

    /// Wake every waiter of `queue`. Does not latch an event.
    pub(crate) fn notify_all(&mut self, queue: QueueId) {
        while let Some(head) = self.queue_waiters(queue) {
            self.wake_waiter(queue, head);
        }
    }

    fn wake_waiter(&mut self, queue: QueueId, thread: ThreadId) {
        self.wake_list_remove(thread);
        self.queue_remove(queue, thread);
        if let WaitTimer::Armed(timer) = self.threads[thread].timer {
            self.timer_cancel(timer);
            self.threads[thread].timer = WaitTimer::None;
        }
        log::trace!("{:?} woken from {:?}", thread, queue);
        self.wake(thread);
    }

    /// Record an event from an interrupt handler. Never wakes a thread.
    pub(crate) fn notify_from_isr(&mut self, queue: QueueId) {
        match self.queues[queue].head {
            QueueHead::Empty => self.queues[queue].head = QueueHead::Signaled,
            QueueHead::Signaled => {}
            QueueHead::Waiting(head) => self.threads[head].ec += 1,
        }
    }

    /// Deliver the events recorded by interrupt handlers.
    pub(crate) fn drain_wake_events(&mut self) {
        loop {
            let pending = self
                .rq
                .wake_list_iter(&self.threads)
                .find(|&id| self.threads[id].ec > 0);
            let Some(thread) = pending else { break };

            let queue = match self.threads[thread].link {
                Link::WaitQueue(queue) => queue,
                link => unreachable!("{:?} is in the wake list but linked to {:?}", thread, link),
            };
            let events = mem::take(&mut self.threads[thread].ec);
            for _ in 0..events {
                self.notify(queue);
            }
        }
    }

    /// Called by the timeout timer of a waiting thread.
    pub(crate) fn wait_timeout_expired(&mut self, thread: ThreadId, timer: TimerId) {
        let queue = match self.threads.get(thread) {
            Some(t) if t.timer == WaitTimer::Armed(timer) => match t.link {
                Link::WaitQueue(queue) => queue,
                _ => return,
            },
            _ => return,
        };

        // An interrupt handler got to it first
        let events = mem::take(&mut self.threads[thread].ec);
        if events > 0 {
            for _ in 0..events {
                self.notify(queue);
            }
            return;
        }

        self.wake_list_remove(thread);
        self.queue_remove(queue, thread);
        self.threads[thread].timer = WaitTimer::Expired;
        if let Some(permits) = &mut self.queues[queue].permits {
            *permits += 1;
        }
        log::trace!("{:?} timed out on {:?}", thread, queue);
        self.wake(thread);
    }

    #[cfg(test)]
    pub(crate) fn queue_order(&self, queue: QueueId) -> alloc::vec::Vec<ThreadId> {
        crate::sched::list_iter(&self.threads, self.queue_waiters(queue)).collect()
    }
}

impl<P: Port> Kernel<P> {
    /// Block the current thread on `queue`, with an optional timeout in
    /// system ticks. Returns immediately if an event is latched.
    pub(crate) fn wait_queue(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, P>,
        queue: QueueId,
        ticks: Option<u32>,
    ) -> Result<(), TimeoutError> {
        match self.state.write(&mut *lock).wait_begin(queue, ticks) {
            WaitBegin::Latched => return Ok(()),
            WaitBegin::Blocked => {}
        }
        self.schedule(lock.borrow_mut());
        self.state.write(&mut *lock).wait_end()
    }

    /// Convert milliseconds to system ticks.
    pub(crate) fn ms_to_ticks(&self, lock: klock::CpuLockTokenRefMut<'_, P>, ms: u32) -> u32 {
        let sched = self.state.read(&*lock);
        sched.clocks[sched.sys_clock.0].ms_to_ticks(ms)
    }

    /// Get the total number of system ticks.
    pub(crate) fn sys_ticks(&self, lock: klock::CpuLockTokenRefMut<'_, P>) -> u64 {
        let sched = self.state.read(&*lock);
        sched.clocks[sched.sys_clock.0].ticks()
    }
}

/// A queue of threads blocked on an event.
///
/// An event delivered while no thread is waiting is latched: the next
/// [`wait`](Self::wait) consumes it and returns immediately. Latched events
/// don't accumulate.
pub struct ThreadQueue<P: Port> {
    kernel: &'static Kernel<P>,
    id: QueueId,
}

impl<P: Port> ThreadQueue<P> {
    pub fn new(kernel: &'static Kernel<P>) -> Result<Self, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let id = kernel.state.write(&mut *lock).create_queue();
        Ok(Self { kernel, id })
    }

    pub fn kernel(&self) -> &'static Kernel<P> {
        self.kernel
    }

    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    /// Block until an event is delivered.
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel, lock.borrow_mut())?;
        crate::error::expect_not_timeout(self.kernel.wait_queue(lock.borrow_mut(), self.id, None));
        self.kernel.unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Block until an event is delivered or `ms` milliseconds pass.
    pub fn wait_timeout(&self, ms: u32) -> Result<(), WaitTimeoutError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel, lock.borrow_mut())?;
        let ticks = self.kernel.ms_to_ticks(lock.borrow_mut(), ms);
        let result = self.kernel.wait_queue(lock.borrow_mut(), self.id, Some(ticks));
        self.kernel.unlock_cpu_and_yield(lock);
        Ok(result?)
    }

    /// Wake the first waiting thread, or latch the event if nobody is
    /// waiting. Followed by a yield point.
    pub fn notify(&self) -> Result<(), NotifyError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel, lock.borrow_mut())?;
        self.kernel.state.write(&mut *lock).notify(self.id);
        self.kernel.unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Deliver an event from an interrupt handler. The waiter is woken at the
    /// next scheduling point.
    pub fn notify_from_isr(&self, isr: Isr<'_, P>) {
        let _ = isr;
        match klock::lock_cpu::<P>() {
            Ok(mut lock) => self.kernel.state.write(&mut *lock).notify_from_isr(self.id),
            Err(_) => log::warn!("notify_from_isr called with CPU Lock active"),
        }
    }

    /// Return `true` if at least one thread is waiting.
    pub fn has_waiters(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(!self.kernel.state.read(&*lock).queue_is_empty(self.id))
    }
}

impl<P: Port> fmt::Debug for ThreadQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match klock::lock_cpu::<P>() {
            Ok(lock) => {
                let sched = self.kernel.state.read(&*lock);
                f.debug_struct("ThreadQueue")
                    .field("id", &self.id)
                    .field("head", &sched.queues[self.id].head)
                    .finish()
            }
            Err(_) => f
                .debug_struct("ThreadQueue")
                .field("id", &self.id)
                .finish_non_exhaustive(),
        }
    }
}

impl<P: Port> Drop for ThreadQueue<P> {
    /// # Panics
    ///
    /// Panics if threads are still waiting on the queue.
    fn drop(&mut self) {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            log::warn!("leaking {:?}: CPU Lock is active", self.id);
            return;
        };
        let sched = self.kernel.state.write(&mut *lock);
        assert!(
            sched.queue_is_empty(self.id),
            "{:?} dropped with waiting threads",
            self.id
        );
        sched.queues.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sched::ScheduleDecision, testing};
    use std::vec::Vec;

    /// `main` blocks on `q` and `next` takes over.
    fn block(sched: &mut Scheduler<testing::NullPort>, q: QueueId, ticks: Option<u32>) {
        assert_eq!(sched.wait_begin(q, ticks), WaitBegin::Blocked);
        assert!(matches!(sched.pick_next(), ScheduleDecision::SwitchTo { .. }));
    }

    #[test]
    fn notify_latches_once() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let q = sched.create_queue();

        sched.notify(q);
        sched.notify(q);
        assert_eq!(sched.queues[q].head, QueueHead::Signaled);
        assert_eq!(sched.wait_begin(q, None), WaitBegin::Latched);
        assert_eq!(sched.queues[q].head, QueueHead::Empty);
        assert_eq!(sched.threads[main].state, RunState::Running);
    }

    #[test]
    fn notify_from_isr_latches_once() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let q = sched.create_queue();

        sched.notify_from_isr(q);
        sched.notify_from_isr(q);
        assert_eq!(sched.queues[q].head, QueueHead::Signaled);
        assert_eq!(sched.wait_begin(q, None), WaitBegin::Latched);
    }

    #[test]
    fn waiters_are_ordered_by_priority() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let a = testing::spawn(&mut sched, "a", 100);
        let b = testing::spawn(&mut sched, "b", 150);
        let c = testing::spawn(&mut sched, "c", 100);
        let q = sched.create_queue();

        // Everyone blocks on `q`, one after another
        for _ in 0..3 {
            block(&mut sched, q, None);
        }
        assert_eq!(sched.current, Some(b));
        assert_eq!(sched.queue_order(q), [a, c, main]);

        // `a` is woken first
        sched.notify(q);
        assert_eq!(sched.queue_order(q), [c, main]);
        assert_eq!(sched.threads[a].state, RunState::Running);
        assert!(sched.threads[b].need_resched);
    }

    #[test]
    fn last_waiter_removal_does_not_latch() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let other = testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, None);
        sched.notify(q);
        assert_eq!(sched.queues[q].head, QueueHead::Empty);
        assert_eq!(sched.current, Some(other));
    }

    #[test]
    fn isr_events_are_delivered_at_scheduling_point() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let a = testing::spawn(&mut sched, "a", 120);
        let other = testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, None); // main
        block(&mut sched, q, None); // a
        assert_eq!(sched.current, Some(other));

        sched.notify_from_isr(q);
        sched.notify_from_isr(q);
        sched.notify_from_isr(q);
        assert_eq!(sched.threads[main].ec, 3);
        assert_eq!(sched.threads[main].state, RunState::Waiting);

        sched.drain_wake_events();
        assert_eq!(sched.threads[main].state, RunState::Running);
        assert_eq!(sched.threads[a].state, RunState::Running);
        // The third event found nobody waiting
        assert_eq!(sched.queues[q].head, QueueHead::Signaled);
        assert!(sched.threads[other].need_resched);
    }

    #[test]
    fn event_count_moves_with_head() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let high = testing::spawn(&mut sched, "high", 100);
        let other = testing::spawn(&mut sched, "other", 200);
        let q = sched.create_queue();

        block(&mut sched, q, None); // main; `high` runs
        sched.notify_from_isr(q);
        assert_eq!(sched.threads[main].ec, 1);

        // `high` becomes the new head and inherits the count
        block(&mut sched, q, None);
        assert_eq!(sched.current, Some(other));
        assert_eq!(sched.queue_order(q), [high, main]);
        assert_eq!(sched.threads[high].ec, 1);
        assert_eq!(sched.threads[main].ec, 0);

        sched.drain_wake_events();
        assert_eq!(sched.threads[high].state, RunState::Running);
        assert_eq!(sched.threads[main].state, RunState::Waiting);
    }

    #[test]
    fn timeout_removes_waiter() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let other = testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, Some(5));
        testing::advance(&mut sched, 4);
        assert_eq!(sched.threads[main].state, RunState::Waiting);
        testing::advance(&mut sched, 1);
        assert_eq!(sched.threads[main].state, RunState::Running);
        assert!(sched.queue_is_empty(q));
        assert!(!sched.threads[main].in_wake_list);
        assert!(sched.threads[other].need_resched);

        // `main` resumes and observes the timeout
        sched.pick_next();
        assert_eq!(sched.current, Some(main));
        assert_eq!(sched.wait_end(), Err(TimeoutError::Timeout));
        assert_eq!(sched.threads[main].timer, WaitTimer::None);
    }

    #[test]
    fn notify_before_timeout_cancels_timer() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, Some(5));
        sched.notify(q);
        assert!(!sched.timers_pending());
        testing::advance(&mut sched, 10);

        sched.pick_next();
        assert_eq!(sched.current, Some(main));
        assert_eq!(sched.wait_end(), Ok(()));
    }

    #[test]
    fn notify_on_expiry_tick_beats_unprocessed_timeout() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, Some(5));
        // The expiry tick has arrived but hasn't been processed
        for _ in 0..5 {
            sched.clocks[0].tick();
        }
        sched.notify(q);
        sched.update_clocks();
        assert!(!sched.timers_pending());
        assert_eq!(sched.queues[q].head, QueueHead::Empty);

        sched.pick_next();
        assert_eq!(sched.current, Some(main));
        assert_eq!(sched.wait_end(), Ok(()));
    }

    #[test]
    fn processed_timeout_beats_notify_on_expiry_tick() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, Some(5));
        testing::advance(&mut sched, 5);
        sched.notify(q);
        // Nobody was waiting anymore
        assert_eq!(sched.queues[q].head, QueueHead::Signaled);

        sched.pick_next();
        assert_eq!(sched.current, Some(main));
        assert_eq!(sched.wait_end(), Err(TimeoutError::Timeout));
    }

    #[test]
    fn isr_event_beats_timeout_on_expiry_tick() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, Some(5));
        sched.notify_from_isr(q);
        testing::advance(&mut sched, 5);
        assert_eq!(sched.threads[main].state, RunState::Running);
        assert_eq!(sched.threads[main].ec, 0);
        assert_eq!(sched.queues[q].head, QueueHead::Empty);
        assert!(!sched.timers_pending());

        sched.pick_next();
        assert_eq!(sched.current, Some(main));
        assert_eq!(sched.wait_end(), Ok(()));
    }

    #[test]
    fn isr_event_outlives_destroyed_waiter() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let other = testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        block(&mut sched, q, None);
        sched.notify_from_isr(q);
        sched.destroy_thread(main);
        assert_eq!(sched.queues[q].head, QueueHead::Signaled);

        assert_eq!(sched.current, Some(other));
        assert_eq!(sched.wait_begin(q, None), WaitBegin::Latched);
    }

    #[test]
    fn timeout_gives_back_reservation() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        testing::spawn(&mut sched, "other", 130);
        let q = sched.create_queue();

        // A semaphore at zero, which `main` takes down to -1
        sched.queues[q].permits = Some(-1);
        block(&mut sched, q, Some(3));
        testing::advance(&mut sched, 3);
        assert_eq!(sched.queues[q].permits, Some(0));
        assert!(sched.queue_is_empty(q));
    }

    #[test]
    fn notify_all_wakes_everyone() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        let a = testing::spawn(&mut sched, "a", 120);
        testing::spawn(&mut sched, "other", 200);
        let q = sched.create_queue();

        block(&mut sched, q, None);
        block(&mut sched, q, None);
        sched.notify_all(q);
        assert_eq!(sched.queues[q].head, QueueHead::Empty);
        let rq: Vec<ThreadId> = sched.rq.iter(&sched.threads).collect();
        assert_eq!(rq, [main, a]);
    }
}
