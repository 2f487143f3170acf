//! Mutexes
use core::fmt;

use crate::{
    error::{
        expect_not_timeout, LockMutexError, LockMutexTimeoutError, TimeoutError,
        TryLockMutexError, UnlockMutexError,
    },
    klock::{self, CpuLockCell},
    state,
    thread::ThreadId,
    BadContextError, Isr, Kernel, Port, ThreadQueue,
};

/// A reentrant mutex.
///
/// The owner runs with preemption disabled: each hold level disables
/// preemption once, and the matching [`unlock`](Self::unlock) enables it
/// again. The owner still gives up the processor when it blocks.
pub struct Mutex<P: Port> {
    queue: ThreadQueue<P>,
    st: CpuLockCell<P, MutexSt>,
}

#[derive(Debug, Default)]
struct MutexSt {
    owner: Option<ThreadId>,
    /// The hold count. Non-zero iff `owner` is `Some(_)`.
    count: u32,
}

/// The outcome of one acquisition attempt.
enum Acquire {
    Acquired,
    Contended,
}

impl<P: Port> Mutex<P> {
    pub fn new(kernel: &'static Kernel<P>) -> Result<Self, BadContextError> {
        Ok(Self {
            queue: ThreadQueue::new(kernel)?,
            st: CpuLockCell::new(MutexSt::default()),
        })
    }

    fn kernel(&self) -> &'static Kernel<P> {
        self.queue.kernel()
    }

    /// Take the mutex for the current thread if it's free or already owned by
    /// it.
    fn try_acquire(&self, mut lock: klock::CpuLockTokenRefMut<'_, P>) -> Acquire {
        let current = self.kernel().state.read(&*lock).current();
        let st = self.st.write(&mut *lock);
        match st.owner {
            Some(owner) if owner != current => return Acquire::Contended,
            _ => {}
        }
        st.owner = Some(current);
        st.count += 1;
        let count = st.count;
        self.kernel().state.write(&mut *lock).preempt_disable();
        log::trace!("{:?} locked by {:?} (level {})", self.queue.id(), current, count);
        Acquire::Acquired
    }

    /// Acquire the mutex, blocking while another thread holds it.
    pub fn lock(&self) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel(), lock.borrow_mut())?;
        while let Acquire::Contended = self.try_acquire(lock.borrow_mut()) {
            expect_not_timeout(self.wait(lock.borrow_mut(), None));
        }
        self.kernel().unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Acquire the mutex, giving up after `ms` milliseconds.
    pub fn lock_timeout(&self, ms: u32) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self.kernel(), lock.borrow_mut())?;
        let kernel = self.kernel();
        let ticks = kernel.ms_to_ticks(lock.borrow_mut(), ms);
        let deadline = kernel.sys_ticks(lock.borrow_mut()) + u64::from(ticks);

        let result = loop {
            if let Acquire::Acquired = self.try_acquire(lock.borrow_mut()) {
                break Ok(());
            }
            let now = kernel.sys_ticks(lock.borrow_mut());
            let remaining = match deadline.checked_sub(now) {
                Some(remaining) if remaining > 0 => remaining,
                _ => break Err(TimeoutError::Timeout),
            };
            let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
            if let Err(e) = self.wait(lock.borrow_mut(), Some(remaining)) {
                break Err(e);
            }
        };
        kernel.unlock_cpu_and_check_preemption(lock);
        Ok(result?)
    }

    /// Acquire the mutex without blocking. Fails with `Timeout` if another
    /// thread holds it.
    pub fn try_lock(&self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel(), lock.borrow_mut())?;
        match self.try_acquire(lock.borrow_mut()) {
            Acquire::Acquired => Ok(()),
            Acquire::Contended => Err(TryLockMutexError::Timeout),
        }
    }

    fn wait(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, P>,
        ticks: Option<u32>,
    ) -> Result<(), TimeoutError> {
        self.kernel().wait_queue(lock, self.queue.id(), ticks)
    }

    /// Release one hold level. The last one wakes the first waiter. Followed
    /// by a yield point.
    ///
    /// # Panics
    ///
    /// Panics if the current thread doesn't own the mutex.
    pub fn unlock(&self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self.kernel(), lock.borrow_mut())?;
        let current = self.kernel().state.read(&*lock).current();

        let st = self.st.write(&mut *lock);
        assert_eq!(
            st.owner,
            Some(current),
            "{:?} unlocked by a thread that doesn't own it",
            self.queue.id()
        );
        st.count -= 1;
        let released = st.count == 0;
        if released {
            st.owner = None;
        }

        let sched = self.kernel().state.write(&mut *lock);
        if released {
            log::trace!("{:?} released by {:?}", self.queue.id(), current);
            sched.notify(self.queue.id());
        }
        sched.preempt_enable();
        self.kernel().unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Release the mutex from an interrupt handler, whatever its hold count.
    /// The owner's preemption is enabled again, and a waiter is woken at the
    /// next scheduling point.
    ///
    /// Meant for a mutex the handler knows is to be released entirely.
    pub fn unlock_from_isr(&self, isr: Isr<'_, P>) {
        let _ = isr;
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            log::warn!("unlock_from_isr called with CPU Lock active");
            return;
        };
        let st = self.st.write(&mut *lock);
        let Some(owner) = st.owner.take() else { return };
        let levels = core::mem::take(&mut st.count);

        let sched = self.kernel().state.write(&mut *lock);
        if let Some(thread) = sched.threads.get_mut(owner) {
            thread.preempt_count = thread.preempt_count.saturating_sub(levels);
        }
        sched.notify_from_isr(self.queue.id());
    }

    /// Return `true` if some thread holds the mutex.
    pub fn is_locked(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.st.read(&*lock).owner.is_some())
    }

    /// Get the thread holding the mutex.
    pub fn owner(&self) -> Result<Option<ThreadId>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.st.read(&*lock).owner)
    }
}

impl<P: Port> fmt::Debug for Mutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("queue", &self.queue)
            .field("st", &self.st)
            .finish()
    }
}
