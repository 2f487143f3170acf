//! Execution contexts
use core::{fmt, marker::PhantomData, sync::atomic::Ordering};

use crate::{error::BadContextError, klock, Kernel, Port};

/// Proof that the code runs in an interrupt context of a particular kernel.
///
/// Operations that are legal in interrupt handlers take an `Isr`. They never
/// block or switch threads; their effects on threads are applied at the next
/// scheduling point.
pub struct Isr<'a, P: Port> {
    kernel: &'a Kernel<P>,
    _not_send: PhantomData<*mut ()>,
}

impl<P: Port> Clone for Isr<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for Isr<'_, P> {}

impl<P: Port> fmt::Debug for Isr<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Isr")
    }
}

impl<'a, P: Port> Isr<'a, P> {
    /// Get the kernel this interrupt context belongs to.
    pub fn kernel(&self) -> &'a Kernel<P> {
        self.kernel
    }
}

/// If the current context is not a thread context, return `Err(BadContext)`.
pub(super) fn expect_thread_context<P: Port>(
    kernel: &Kernel<P>,
    lock: klock::CpuLockTokenRefMut<'_, P>,
) -> Result<(), BadContextError> {
    if kernel.is_interrupt_context() || kernel.state.read(&*lock).current.is_none() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`. The
/// idle thread must never block.
pub(super) fn expect_waitable_context<P: Port>(
    kernel: &Kernel<P>,
    lock: klock::CpuLockTokenRefMut<'_, P>,
) -> Result<(), BadContextError> {
    let sched = kernel.state.read(&*lock);
    match sched.current {
        Some(current) if !kernel.is_interrupt_context() && !sched.threads[current].is_idle => {
            Ok(())
        }
        _ => Err(BadContextError::BadContext),
    }
}

impl<P: Port> Kernel<P> {
    /// Return `true` if called from an interrupt handler or a timer callback.
    pub fn is_interrupt_context(&self) -> bool {
        self.isr_nesting.load(Ordering::Relaxed) != 0
    }

    /// Enter an interrupt context. Called by the port at the start of an
    /// interrupt handler.
    ///
    /// # Safety
    ///
    /// Must be paired with [`Self::leave_isr`]. Only meant to be called by
    /// the port, with CPU Lock inactive.
    pub unsafe fn enter_isr(&self) -> Isr<'_, P> {
        self.isr_nesting.fetch_add(1, Ordering::Relaxed);
        Isr {
            kernel: self,
            _not_send: PhantomData,
        }
    }

    /// Leave an interrupt context. Called by the port at the end of an
    /// interrupt handler.
    ///
    /// Leaving the outermost interrupt context is a scheduling point: pending
    /// notifications and expired timers are processed, and the interrupted
    /// thread may be preempted.
    ///
    /// # Safety
    ///
    /// `isr` must be the token returned by the matching [`Self::enter_isr`].
    /// Only meant to be called by the port, with CPU Lock inactive, in the
    /// context of the interrupted thread.
    pub unsafe fn leave_isr(&'static self, isr: Isr<'_, P>) {
        let _ = isr;
        if self.isr_nesting.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }

        let mut lock = match klock::lock_cpu::<P>() {
            Ok(lock) => lock,
            Err(_) => {
                log::warn!("interrupt epilogue skipped: CPU Lock is active");
                return;
            }
        };
        let sched = self.state.write(&mut *lock);
        if sched.current.is_none() {
            return;
        }
        sched.catch_up();
        if sched.take_preempt_request() {
            log::trace!("time slice expired");
            self.unlock_cpu_and_yield(lock);
        } else {
            self.unlock_cpu_and_check_preemption(lock);
        }
    }

    /// Run timer callbacks in an interrupt context.
    pub(crate) fn run_timer_callbacks(
        &'static self,
        expired: impl IntoIterator<Item = (crate::TimerCallback<P>, usize)>,
    ) {
        // Safety: Paired with the decrement below. Timer callbacks run in
        // an interrupt context.
        let isr = unsafe { self.enter_isr() };
        for (callback, arg) in expired {
            callback(isr, arg);
        }
        // Not `leave_isr`; the caller is already at a scheduling point
        self.isr_nesting.fetch_sub(1, Ordering::Relaxed);
    }
}
