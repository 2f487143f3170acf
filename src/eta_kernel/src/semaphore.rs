//! Semaphores
use core::fmt;

use crate::{
    error::{
        expect_not_timeout, SignalSemaphoreError, TryWaitSemaphoreError, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock,
    sched::Scheduler,
    state, BadContextError, Isr, Kernel, Port, ThreadQueue,
};

/// A counting semaphore.
///
/// A negative value is the number of threads blocked in
/// [`wait`](Self::wait) or [`wait_timeout`](Self::wait_timeout).
pub struct Semaphore<P: Port> {
    queue: ThreadQueue<P>,
}

impl<P: Port> Semaphore<P> {
    pub fn new(kernel: &'static Kernel<P>, initial: i32) -> Result<Self, BadContextError> {
        let queue = ThreadQueue::new(kernel)?;
        let mut lock = klock::lock_cpu::<P>()?;
        kernel.state.write(&mut *lock).queues[queue.id()].permits = Some(initial);
        Ok(Self { queue })
    }

    fn kernel(&self) -> &'static Kernel<P> {
        self.queue.kernel()
    }

    /// The value lives in the control block of the queue so that a timeout
    /// can give back the waiter's reservation.
    fn value_mut<'a>(&self, sched: &'a mut Scheduler<P>) -> &'a mut i32 {
        sched.queues[self.queue.id()].permits.get_or_insert(0)
    }

    /// Take a permit, blocking until one is available.
    pub fn wait(&self) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel(), lock.borrow_mut())?;
        let value = self.value_mut(self.kernel().state.write(&mut *lock));
        *value -= 1;
        if *value < 0 {
            expect_not_timeout(self.kernel().wait_queue(
                lock.borrow_mut(),
                self.queue.id(),
                None,
            ));
        }
        self.kernel().unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Take a permit, giving up after `ms` milliseconds. The value is
    /// restored when the wait times out.
    pub fn wait_timeout(&self, ms: u32) -> Result<(), WaitSemaphoreTimeoutError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel(), lock.borrow_mut())?;
        let kernel = self.kernel();
        let ticks = kernel.ms_to_ticks(lock.borrow_mut(), ms);
        let value = self.value_mut(kernel.state.write(&mut *lock));
        *value -= 1;

        let mut result = Ok(());
        if *value < 0 {
            result = kernel.wait_queue(lock.borrow_mut(), self.queue.id(), Some(ticks));
        }
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(result?)
    }

    /// Take a permit if one is available. Fails with `Timeout` otherwise,
    /// leaving the value untouched.
    pub fn try_wait(&self) -> Result<(), TryWaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel(), lock.borrow_mut())?;
        let value = self.value_mut(self.kernel().state.write(&mut *lock));
        if *value <= 0 {
            return Err(TryWaitSemaphoreError::Timeout);
        }
        *value -= 1;
        Ok(())
    }

    /// Return a permit, waking a waiter if any. Followed by a yield point.
    pub fn signal(&self) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel(), lock.borrow_mut())?;
        let sched = self.kernel().state.write(&mut *lock);
        let value = self.value_mut(sched);
        *value += 1;
        if *value <= 0 {
            sched.notify(self.queue.id());
        }
        self.kernel().unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Return a permit from an interrupt handler. A waiter is woken at the
    /// next scheduling point.
    pub fn signal_from_isr(&self, isr: Isr<'_, P>) {
        let _ = isr;
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            log::warn!("signal_from_isr called with CPU Lock active");
            return;
        };
        let sched = self.kernel().state.write(&mut *lock);
        let value = self.value_mut(sched);
        *value += 1;
        if *value <= 0 {
            sched.notify_from_isr(self.queue.id());
        }
    }

    /// Get the current value.
    pub fn value(&self) -> Result<i32, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        let sched = self.kernel().state.read(&*lock);
        Ok(sched.queues[self.queue.id()].permits.unwrap_or(0))
    }
}

impl<P: Port> fmt::Debug for Semaphore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("queue", &self.queue)
            .field("value", &self.value())
            .finish()
    }
}
