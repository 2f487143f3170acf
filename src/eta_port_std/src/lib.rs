#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use eta_kernel::{Isr, Kernel, KernelCfg, Port, PrepareStackError, ThreadEntry, ThreadStart};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate eta_kernel;

/// The minimum stack size of a backing OS thread. A kernel thread's stack size
/// is usually too small for a hosted environment.
const MIN_OS_STACK_SIZE: usize = 256 * 1024;

/// Implemented on a port type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: Port<Context = ThreadContext> {
    fn port_state() -> &'static State<Self>;
}

/// The saved context of a kernel thread: the slot of its backing OS thread.
#[derive(Debug)]
pub struct ThreadContext {
    slot: usize,
}

/// The simulated processor.
#[derive(Debug)]
struct Cpu {
    /// The slot of the OS thread owning the processor.
    running: Option<usize>,
    cpu_lock: bool,
    next_slot: usize,
    /// Slots whose contexts were released before they ever ran.
    released: BTreeSet<usize>,
    shutdown: bool,
    idle_ticks: u64,
}

/// The unwinding payload used to tear down the backing OS thread of an
/// exited kernel thread.
struct ThreadExit;

thread_local! {
    /// The slot to dispatch once the current OS thread finishes unwinding.
    static EXIT_TO: Cell<Option<usize>> = Cell::new(None);
}

/// The internal state of the port.
#[doc(hidden)]
pub struct State<P: Port> {
    cpu: Mutex<Cpu>,
    cpu_cond: Condvar,
    kernel: OnceCell<&'static Kernel<P>>,
    panic_payload: SpinMutex<Option<Box<dyn Any + Send>>>,
}

#[allow(clippy::missing_safety_doc)]
impl<P: Port> State<P> {
    pub const fn new() -> Self {
        Self {
            cpu: Mutex::new(Cpu {
                running: None,
                cpu_lock: false,
                next_slot: 0,
                released: BTreeSet::new(),
                shutdown: false,
                idle_ticks: 0,
            }),
            cpu_cond: Condvar::new(),
            kernel: OnceCell::new(),
            panic_payload: SpinMutex::new(None),
        }
    }

    fn cpu(&self) -> MutexGuard<'_, Cpu> {
        // A panicking kernel thread shuts the system down anyway
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kernel(&self) -> &'static Kernel<P> {
        match self.kernel.get() {
            Some(kernel) => kernel,
            None => panic!("the kernel hasn't been booted"),
        }
    }

    /// Block the calling OS thread until it owns the processor. Returns
    /// `false` if its context was released instead.
    fn wait_turn(&self, mut cpu: MutexGuard<'_, Cpu>, slot: usize) -> bool {
        loop {
            if cpu.shutdown {
                drop(cpu);
                halt();
            }
            if cpu.running == Some(slot) {
                return true;
            }
            if cpu.released.remove(&slot) {
                return false;
            }
            cpu = self
                .cpu_cond
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand the processor over to `slot`.
    fn dispatch(&self, cpu: &mut Cpu, slot: usize) {
        log::trace!("dispatching slot {}", slot);
        cpu.running = Some(slot);
        self.cpu_cond.notify_all();
    }

    /// Record a panic and shut the system down.
    fn fail(&self, payload: Box<dyn Any + Send>) {
        let mut panic_payload = self.panic_payload.lock();
        if panic_payload.is_none() {
            *panic_payload = Some(payload);
        }
        drop(panic_payload);
        self.shutdown();
    }

    fn shutdown(&self) {
        let mut cpu = self.cpu();
        cpu.shutdown = true;
        self.cpu_cond.notify_all();
    }
}

#[allow(clippy::missing_safety_doc)]
impl<P: PortInstance> State<P> {
    pub fn prepare_stack(
        &'static self,
        stack: &mut [u8],
        start: ThreadStart<P>,
    ) -> Result<ThreadContext, PrepareStackError> {
        let slot = {
            let mut cpu = self.cpu();
            cpu.next_slot += 1;
            cpu.next_slot
        };

        let builder = std::thread::Builder::new()
            .name(format!("eta-{}", slot))
            .stack_size(stack.len().max(MIN_OS_STACK_SIZE));
        let spawned = builder.spawn(move || {
            if !self.wait_turn(self.cpu(), slot) {
                log::trace!("slot {} released before running", slot);
                return;
            }

            // Safety: We are the port, and this is the first dispatch of
            // this thread. CPU Lock was handed over to us.
            let result =
                panic::catch_unwind::<_, ()>(AssertUnwindSafe(|| unsafe { start.start() }));
            let Err(payload) = result else { return };

            if payload.is::<ThreadExit>() {
                match EXIT_TO.with(Cell::take) {
                    Some(incoming) => self.dispatch(&mut self.cpu(), incoming),
                    None => self.fail(Box::new("a thread exited without a successor")),
                }
            } else {
                log::debug!("slot {} panicked; shutting down", slot);
                self.fail(payload);
            }
        });

        match spawned {
            Ok(_) => Ok(ThreadContext { slot }),
            Err(e) => {
                log::warn!("failed to spawn a backing thread: {}", e);
                Err(PrepareStackError::NoMemory)
            }
        }
    }

    pub unsafe fn switch_context(
        &'static self,
        outgoing: NonNull<ThreadContext>,
        incoming: NonNull<ThreadContext>,
    ) {
        // Safety: Both contexts are alive (upheld by the caller)
        let (outgoing, incoming) = unsafe { (outgoing.as_ref().slot, incoming.as_ref().slot) };
        let mut cpu = self.cpu();
        debug_assert_eq!(cpu.running, Some(outgoing));
        self.dispatch(&mut cpu, incoming);
        if !self.wait_turn(cpu, outgoing) {
            // Destroyed while switched out. Unwinding would release CPU Lock
            // on behalf of whoever runs now.
            halt();
        }
    }

    pub unsafe fn dispatch_first_thread(&'static self, incoming: NonNull<ThreadContext>) {
        // Safety: `incoming` is alive (upheld by the caller)
        let incoming = unsafe { incoming.as_ref().slot };
        let mut cpu = self.cpu();
        self.dispatch(&mut cpu, incoming);

        // The boot context never runs again. Wait for the shutdown.
        while !cpu.shutdown {
            cpu = self
                .cpu_cond
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
        log::debug!("shut down after {} idle ticks", cpu.idle_ticks);
    }

    pub unsafe fn exit_and_dispatch(
        &'static self,
        outgoing: NonNull<ThreadContext>,
        incoming: NonNull<ThreadContext>,
    ) -> ! {
        // Safety: Both contexts are alive (upheld by the caller)
        let (outgoing, incoming) = unsafe { (outgoing.as_ref().slot, incoming.as_ref().slot) };
        log::trace!("slot {} exits", outgoing);

        // Unwind first, then hand the processor over. Nothing else runs while
        // this thread's stack is torn down.
        EXIT_TO.with(|c| c.set(Some(incoming)));
        panic::resume_unwind(Box::new(ThreadExit))
    }

    pub fn release_context(&self, context: ThreadContext) {
        let mut cpu = self.cpu();
        if cpu.running != Some(context.slot) {
            cpu.released.insert(context.slot);
            self.cpu_cond.notify_all();
        }
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let mut cpu = self.cpu();
        !std::mem::replace(&mut cpu.cpu_lock, true)
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let mut cpu = self.cpu();
        assert!(cpu.cpu_lock, "CPU Lock is not active");
        cpu.cpu_lock = false;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu().cpu_lock
    }

    /// Called by the idle thread. Every other thread is blocked, so advance
    /// the virtual time to the next tick.
    pub fn wait_for_interrupt(&'static self) {
        if self.cpu().shutdown {
            halt();
        }
        match self.kernel().timers_pending() {
            Ok(true) => {}
            Ok(false) => panic!("deadlock: every thread is blocked and no timer is armed"),
            Err(e) => panic!("wait_for_interrupt: {:?}", e),
        }
        self.cpu().idle_ticks += 1;
        tick::<P>();
    }
}

/// Park the calling OS thread forever.
fn halt() -> ! {
    loop {
        std::thread::park();
    }
}

/// Boot the kernel with `cfg`, running `main` with `arg` in the main thread.
///
/// Returns when the system is shut down by [`shutdown`]. A panic in a kernel
/// thread is propagated.
///
/// # Panics
///
/// Panics if the port was booted before.
pub fn boot<P: PortInstance>(cfg: KernelCfg, main: ThreadEntry<P>, arg: usize) {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = P::port_state();
    let kernel: &'static Kernel<P> = Box::leak(Box::new(Kernel::new(cfg)));
    if state.kernel.set(kernel).is_err() {
        panic!("the port was already booted");
    }

    if let Err(e) = kernel.boot(main, arg) {
        panic!("failed to boot: {:?}", e);
    }

    // Propagate any panic that occurred in a kernel thread
    if let Some(payload) = state.panic_payload.lock().take() {
        panic::resume_unwind(payload);
    }
}

/// Shut the system down. [`boot`] returns when the calling thread is parked.
pub fn shutdown<P: PortInstance>() -> ! {
    log::debug!("shutdown requested");
    P::port_state().shutdown();
    halt();
}

/// Run `handler` as an interrupt handler on the current thread. Scheduling
/// decisions made by the handler take effect when it returns.
///
/// Must be called from a kernel thread with CPU Lock inactive.
pub fn raise_interrupt<P: PortInstance>(handler: impl FnOnce(Isr<'_, P>)) {
    let state = P::port_state();
    let kernel = state.kernel();
    assert!(
        !state.is_cpu_lock_active(),
        "interrupts are masked while CPU Lock is active"
    );

    // Safety: We are the port. CPU Lock is inactive, and the handler runs in
    // the context of the interrupted thread.
    let isr = unsafe { kernel.enter_isr() };
    handler(isr);
    unsafe { kernel.leave_isr(isr) };
}

/// Deliver one tick of the system clock.
pub fn tick<P: PortInstance>() {
    raise_interrupt::<P>(|isr| {
        let kernel = isr.kernel();
        kernel.clock_tick(isr, kernel.system_clock());
    });
}

/// Get the number of ticks the idle thread delivered so far.
pub fn idle_ticks<P: PortInstance>() -> u64 {
    P::port_state().cpu().idle_ticks
}

/// Instantiate the port for a unit struct named `$Name`.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Name:ident) => {
        $vis struct $Name;

        mod port_std_impl {
            use super::$Name;
            use $crate::eta_kernel::{Port, PrepareStackError, ThreadStart};
            use $crate::{PortInstance, State, ThreadContext};
            use ::core::ptr::NonNull;

            pub(super) static PORT_STATE: State<$Name> = State::new();

            unsafe impl PortInstance for $Name {
                #[inline]
                fn port_state() -> &'static State<Self> {
                    &PORT_STATE
                }
            }

            unsafe impl Port for $Name {
                type Context = ThreadContext;

                fn prepare_stack(
                    stack: &mut [u8],
                    start: ThreadStart<Self>,
                ) -> Result<ThreadContext, PrepareStackError> {
                    PORT_STATE.prepare_stack(stack, start)
                }

                unsafe fn switch_context(
                    outgoing: NonNull<ThreadContext>,
                    incoming: NonNull<ThreadContext>,
                ) {
                    unsafe { PORT_STATE.switch_context(outgoing, incoming) }
                }

                unsafe fn dispatch_first_thread(incoming: NonNull<ThreadContext>) {
                    unsafe { PORT_STATE.dispatch_first_thread(incoming) }
                }

                unsafe fn exit_and_dispatch(
                    outgoing: NonNull<ThreadContext>,
                    incoming: NonNull<ThreadContext>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch(outgoing, incoming) }
                }

                fn release_context(context: ThreadContext) {
                    PORT_STATE.release_context(context)
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn wait_for_interrupt() {
                    PORT_STATE.wait_for_interrupt()
                }
            }
        }
    };
}
