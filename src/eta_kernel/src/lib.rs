#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

extern crate alloc;

use core::{fmt, ptr::NonNull, sync::atomic::AtomicUsize};

mod cfg;
mod clock;
mod error;
mod ipm;
mod klock;
mod mutex;
mod sched;
mod semaphore;
mod state;
mod thread;
mod timer;
mod utils;
mod wait;

#[cfg(test)]
mod testing;

pub use self::{
    cfg::*,
    clock::{ClockId, ClockInfo},
    error::*,
    ipm::IpmQueue,
    mutex::Mutex,
    sched::SchedPolicy,
    semaphore::Semaphore,
    state::Isr,
    thread::{Priority, RunState, ThreadEntry, ThreadId, ThreadStart},
    timer::{TimerCallback, TimerFlags, TimerId},
    wait::ThreadQueue,
};

/// Implemented by a port. The kernel controls the processor through these
/// methods.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel. An implementation
/// must honor the contract documented on each method. In particular, CPU Lock
/// is handed over across context switches: the incoming thread resumes with
/// CPU Lock active, and it's the incoming thread that eventually releases it.
pub unsafe trait Port: Sized + Send + Sync + 'static {
    /// The saved execution state of a thread.
    type Context: Send + fmt::Debug + 'static;

    /// Build the initial context of a thread on `stack`.
    ///
    /// When the thread is dispatched for the first time, the port must call
    /// [`ThreadStart::start`] on the thread's own stack with CPU Lock active.
    fn prepare_stack(
        stack: &mut [u8],
        start: ThreadStart<Self>,
    ) -> Result<Self::Context, PrepareStackError>;

    /// Save the current thread's state to `outgoing` and restore `incoming`.
    /// Returns when `outgoing` is dispatched again.
    ///
    /// # Safety
    ///
    /// CPU Lock is active. Both contexts are alive and distinct.
    unsafe fn switch_context(outgoing: NonNull<Self::Context>, incoming: NonNull<Self::Context>);

    /// Transfer the control to the first thread.
    ///
    /// On a real target this never returns. A hosted port may return when the
    /// simulated system shuts down.
    ///
    /// # Safety
    ///
    /// CPU Lock is active. Only called once by [`Kernel::boot`].
    unsafe fn dispatch_first_thread(incoming: NonNull<Self::Context>);

    /// Abandon the current thread, whose state is saved in `outgoing`, and
    /// dispatch `incoming`. `outgoing` is never dispatched again.
    ///
    /// # Safety
    ///
    /// CPU Lock is active. Both contexts are alive and distinct.
    unsafe fn exit_and_dispatch(
        outgoing: NonNull<Self::Context>,
        incoming: NonNull<Self::Context>,
    ) -> !;

    /// Release a context that will never be dispatched again.
    fn release_context(context: Self::Context) {
        drop(context);
    }

    /// Enter CPU Lock. Return `false` if CPU Lock is already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave CPU Lock.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel. CPU Lock is active.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Wait until an interrupt arrives. Called by the idle thread with CPU
    /// Lock inactive.
    fn wait_for_interrupt();

    /// Start the hardware backing a clock source. Called once per clock
    /// source before it's registered.
    fn clock_enable(clock: &ClockInfo) -> Result<(), ClockEnableError> {
        let _ = clock;
        Ok(())
    }
}

/// A kernel instance.
///
/// Kernel objects are created at runtime and refer to the kernel through a
/// `&'static Kernel`, so an instance is usually leaked or placed in a static.
/// CPU Lock is a per-port singleton; a port type must not back more than one
/// running kernel.
pub struct Kernel<P: Port> {
    state: klock::CpuLockCell<P, sched::Scheduler<P>>,
    cfg: KernelCfg,
    /// The nesting level of interrupt contexts. Non-zero while an interrupt
    /// handler or a timer callback is running.
    isr_nesting: AtomicUsize,
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel. Nothing runs until [`Self::boot`] is called.
    pub fn new(cfg: KernelCfg) -> Self {
        Self {
            state: klock::CpuLockCell::new(sched::Scheduler::new(&cfg)),
            cfg,
            isr_nesting: AtomicUsize::new(0),
        }
    }

    /// Get the configuration this kernel was constructed with.
    pub fn cfg(&self) -> &KernelCfg {
        &self.cfg
    }
}

impl<P: Port> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("cfg", &self.cfg)
            .field("isr_nesting", &self.isr_nesting)
            .finish_non_exhaustive()
    }
}
