//! Threads
use alloc::{boxed::Box, vec::Vec};
use arrayvec::ArrayString;
use core::{convert::Infallible, fmt, mem, ptr::NonNull};

use crate::{
    error::{
        expect_not_timeout, BadContextError, BootError, CreateThreadError, DestroyThreadError,
        JoinError, NiceError, NoMemoryError, SetDeadlineError, SleepError, UnparkError,
        YieldError,
    },
    klock,
    sched::{SchedClass, Scheduler},
    state,
    timer::TimerId,
    utils::define_key,
    wait::QueueId,
    Kernel, Port, PRIO_LOWEST, THREAD_NAME_LEN,
};

/// Thread priority. A lower value means a higher priority.
pub type Priority = u8;

/// The entry point of a thread. Receives the kernel and the argument given at
/// creation.
pub type ThreadEntry<P> = fn(&'static Kernel<P>, usize);

define_key! {
    /// Identifies a thread. A handle to a destroyed thread is never reused
    /// for another thread.
    pub struct ThreadId;
}

/// The run state of a thread. Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// The thread is running or ready to run.
    Running,
    /// The thread is sleeping for a fixed duration.
    Sleeping,
    /// The thread is blocked on a [`ThreadQueue`](crate::ThreadQueue).
    Waiting,
    /// The thread is parked until [`Kernel::unpark`] is called.
    Parked,
    /// The thread has finished. It's reclaimed by [`Kernel::join`] or
    /// [`Kernel::thread_destroy`].
    Exited,
}

/// The list a thread is linked into through [`ThreadCb::next`]. A thread is
/// on at most one list at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    None,
    RunQueue,
    WaitQueue(QueueId),
}

/// The state of the timeout timer of a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTimer {
    None,
    Armed(TimerId),
    /// The timer fired and removed the thread from its wait queue. Consumed
    /// by the thread when it resumes.
    Expired,
}

/// Owns a context handed out by [`Port::prepare_stack`]. The pointee has a
/// stable address for the port to save state into.
pub(crate) struct ContextPtr<P: Port>(NonNull<P::Context>);

// Safety: `ContextPtr` owns the pointee uniquely, and `P::Context: Send`
unsafe impl<P: Port> Send for ContextPtr<P> {}

impl<P: Port> ContextPtr<P> {
    fn new(context: P::Context) -> Self {
        Self(NonNull::from(Box::leak(Box::new(context))))
    }

    pub(crate) fn as_ptr(&self) -> NonNull<P::Context> {
        self.0
    }

    fn into_inner(self) -> P::Context {
        // Safety: `self.0` was created by `Box::leak` in `Self::new`, and
        // `self` is consumed
        *unsafe { Box::from_raw(self.0.as_ptr()) }
    }
}

/// *Thread control block* - the state data of a thread.
pub(crate) struct ThreadCb<P: Port> {
    pub(crate) name: ArrayString<THREAD_NAME_LEN>,

    /// The base priority, set at creation and by `nice`.
    pub(crate) priority: Priority,
    /// The priority used for ordering when the dynamic-priority policy is in
    /// effect. Ages toward [`crate::PRIO_HIGHEST`] while the thread waits in
    /// the run queue.
    pub(crate) dyn_priority: Priority,
    /// The absolute deadline in system ticks, for the earliest-deadline-first
    /// policy.
    pub(crate) deadline: Option<u64>,

    pub(crate) state: RunState,
    pub(crate) is_idle: bool,
    /// The thread is the current thread or linked into the run queue.
    pub(crate) on_rq: bool,

    /// The thread should yield at the next scheduling point.
    pub(crate) need_resched: bool,
    /// The time slice ran out. Turned into `need_resched` by the interrupt
    /// epilogue.
    pub(crate) preempt_need_resched: bool,
    /// Non-zero inhibits preemption of this thread.
    pub(crate) preempt_count: u32,
    /// Remaining system ticks in the current time slice.
    pub(crate) slice: u32,

    pub(crate) link: Link,
    pub(crate) next: Option<ThreadId>,

    /// The next entry of the wake list. Only meaningful while `in_wake_list`.
    pub(crate) wake_next: Option<ThreadId>,
    pub(crate) in_wake_list: bool,
    /// Notifications recorded by interrupt handlers, pending delivery to the
    /// queue this thread heads.
    pub(crate) ec: u32,

    pub(crate) timer: WaitTimer,
    pub(crate) park_token: bool,
    /// Threads waiting for this one to exit.
    pub(crate) join_queue: QueueId,

    entry: ThreadEntry<P>,
    arg: usize,
    context: Option<ContextPtr<P>>,
    stack: Option<Box<[u8]>>,
}

impl<P: Port> ThreadCb<P> {
    pub(crate) fn new(
        name: ArrayString<THREAD_NAME_LEN>,
        priority: Priority,
        entry: ThreadEntry<P>,
        arg: usize,
        join_queue: QueueId,
    ) -> Self {
        Self {
            name,
            priority,
            dyn_priority: priority,
            deadline: None,
            state: RunState::Running,
            is_idle: false,
            on_rq: false,
            need_resched: false,
            preempt_need_resched: false,
            preempt_count: 0,
            slice: 0,
            link: Link::None,
            next: None,
            wake_next: None,
            in_wake_list: false,
            ec: 0,
            timer: WaitTimer::None,
            park_token: false,
            join_queue,
            entry,
            arg,
            context: None,
            stack: None,
        }
    }
}

impl<P: Port> fmt::Debug for ThreadCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("name", &self.name.as_str())
            .field("priority", &self.priority)
            .field("dyn_priority", &self.dyn_priority)
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .field("on_rq", &self.on_rq)
            .field("need_resched", &self.need_resched)
            .field("preempt_count", &self.preempt_count)
            .field("link", &self.link)
            .field("timer", &self.timer)
            .field("context", &self.context.as_ref().map(|c| c.as_ptr()))
            .finish_non_exhaustive()
    }
}

/// What remains of a destroyed thread. Released outside CPU Lock.
pub(crate) struct ThreadRemains<P: Port> {
    context: Option<ContextPtr<P>>,
    stack: Option<Box<[u8]>>,
}

impl<P: Port> ThreadRemains<P> {
    fn release(self) {
        if let Some(context) = self.context {
            P::release_context(context.into_inner());
        }
        drop(self.stack);
    }
}

/// The first code a new thread runs. Passed to [`Port::prepare_stack`].
pub struct ThreadStart<P: Port> {
    kernel: &'static Kernel<P>,
    thread: ThreadId,
}

impl<P: Port> fmt::Debug for ThreadStart<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadStart").field(&self.thread).finish()
    }
}

impl<P: Port> ThreadStart<P> {
    /// Run the thread's entry point, then exit the thread.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port when the thread is dispatched for
    /// the first time, on the thread's own stack, with CPU Lock active.
    pub unsafe fn start(self) -> ! {
        let kernel = self.kernel;

        // Safety: The dispatcher hands CPU Lock over to the incoming thread
        let lock = unsafe { klock::assume_cpu_lock::<P>() };
        let thread = &kernel.state.read(&*lock).threads[self.thread];
        let (entry, arg) = (thread.entry, thread.arg);
        log::trace!("{:?} started", self.thread);
        kernel.unlock_cpu_and_check_preemption(lock);

        entry(kernel, arg);

        match kernel.exit_thread() {
            Ok(x) => match x {},
            Err(e) => panic!("failed to exit {:?}: {:?}", self.thread, e),
        }
    }
}

fn alloc_stack(size: usize) -> Result<Box<[u8]>, NoMemoryError> {
    let mut stack = Vec::new();
    stack
        .try_reserve_exact(size)
        .map_err(|_| NoMemoryError::NoMemory)?;
    stack.resize(size, 0);
    Ok(stack.into_boxed_slice())
}

/// The entry point of the idle thread.
fn idle_main<P: Port>(kernel: &'static Kernel<P>, _: usize) {
    loop {
        P::wait_for_interrupt();
        if let Err(e) = kernel.yield_now() {
            log::warn!("idle thread failed to yield: {:?}", e);
        }
    }
}

impl<P: Port> Scheduler<P> {
    /// Make `thread` the current thread without a context switch. Used to
    /// pick the first thread.
    pub(crate) fn dispatch_first(&mut self, thread: ThreadId) {
        if self.threads[thread].link == Link::RunQueue {
            self.rq.remove(&mut self.threads, thread);
        }
        self.current = Some(thread);
        self.policy.post_schedule(&mut self.threads[thread], self.time_slice);
    }

    pub(crate) fn context_ptr(&self, thread: ThreadId) -> NonNull<P::Context> {
        match &self.threads[thread].context {
            Some(context) => context.as_ptr(),
            None => panic!("{:?} has no context", thread),
        }
    }

    /// Find a live thread by name. Exited threads are skipped.
    pub(crate) fn thread_by_name(&self, name: &str) -> Option<ThreadId> {
        self.threads
            .iter()
            .find(|(_, t)| t.name.as_str() == name && t.state != RunState::Exited)
            .map(|(id, _)| id)
    }

    /// Mark the current thread as exited and pick the next thread. Wakes
    /// every joiner.
    pub(crate) fn exit_current(&mut self) -> (ThreadId, ThreadId) {
        let current = self.current();
        let thread = &mut self.threads[current];
        assert!(!thread.is_idle, "the idle thread can't exit");
        thread.state = RunState::Exited;
        thread.on_rq = false;
        thread.need_resched = true;

        let join_queue = thread.join_queue;
        self.notify_all(join_queue);

        match self.pick_next() {
            crate::sched::ScheduleDecision::SwitchTo { from, to } => (from, to),
            crate::sched::ScheduleDecision::Keep => {
                unreachable!("an exited thread was kept running")
            }
        }
    }

    /// Unlink a thread from every kernel structure and remove it.
    ///
    /// # Panics
    ///
    /// Panics if `thread` is stale (which includes destroying a thread
    /// twice), is the current thread, or is the idle thread.
    pub(crate) fn destroy_thread(&mut self, thread: ThreadId) -> ThreadRemains<P> {
        assert!(
            self.threads.contains(thread),
            "{:?} doesn't exist (was it destroyed twice?)",
            thread
        );
        assert_ne!(self.current, Some(thread), "a thread can't destroy itself");
        assert!(!self.threads[thread].is_idle, "the idle thread can't be destroyed");

        match self.threads[thread].link {
            Link::None => {}
            Link::RunQueue => {
                self.rq.remove(&mut self.threads, thread);
            }
            Link::WaitQueue(queue) => {
                self.wake_list_remove(thread);
                self.queue_remove(queue, thread);
            }
        }
        if let WaitTimer::Armed(timer) = self.threads[thread].timer {
            self.timer_cancel(timer);
        }

        let join_queue = self.threads[thread].join_queue;
        self.notify_all(join_queue);
        self.queues.remove(join_queue);

        let cb = match self.threads.remove(thread) {
            Some(cb) => cb,
            None => unreachable!(),
        };
        log::debug!("destroyed {:?} ({})", thread, cb.name);
        ThreadRemains {
            context: cb.context,
            stack: cb.stack,
        }
    }

    /// Put the current thread to sleep for `ticks` system ticks.
    pub(crate) fn sleep_current(&mut self, ticks: u32) {
        let current = self.current();
        let timer = self.timer_create_internal(
            self.sys_clock,
            ticks,
            crate::timer::TimerAction::Sleep(current),
        );
        let thread = &mut self.threads[current];
        thread.timer = WaitTimer::Armed(timer);
        thread.state = RunState::Sleeping;
        thread.on_rq = false;
        thread.need_resched = true;
    }

    /// Called by the sleep timer of `thread`.
    pub(crate) fn sleep_expired(&mut self, thread: ThreadId, timer: TimerId) {
        match self.threads.get_mut(thread) {
            Some(t) if t.timer == WaitTimer::Armed(timer) => t.timer = WaitTimer::None,
            _ => return,
        }
        self.wake(thread);
    }

    /// Park the current thread unless a token is available. Return `true` if
    /// the thread has to be switched out.
    pub(crate) fn park_current(&mut self) -> bool {
        let current = self.current();
        let thread = &mut self.threads[current];
        if mem::take(&mut thread.park_token) {
            return false;
        }
        thread.state = RunState::Parked;
        thread.on_rq = false;
        thread.need_resched = true;
        true
    }

    pub(crate) fn unpark(&mut self, thread: ThreadId) -> Result<(), UnparkError> {
        let state = self.threads.get(thread).ok_or(UnparkError::BadParam)?.state;
        match state {
            RunState::Parked => self.wake(thread),
            RunState::Exited => return Err(UnparkError::BadObjectState),
            _ => self.threads[thread].park_token = true,
        }
        Ok(())
    }
}

impl<P: Port> Kernel<P> {
    /// Start the kernel.
    ///
    /// Creates the idle thread and the main thread, which runs `main` with
    /// `arg`, and dispatches the main thread. Must be called from the boot
    /// context, outside any thread.
    ///
    /// On a real target this doesn't return on success. A hosted port returns
    /// when the simulated system shuts down.
    pub fn boot(&'static self, main: ThreadEntry<P>, arg: usize) -> Result<(), BootError> {
        let sys_info = {
            let lock = klock::lock_cpu::<P>()?;
            let sched = self.state.read(&*lock);
            if sched.current.is_some() {
                return Err(BootError::BadObjectState);
            }
            sched.clocks[sched.sys_clock.0].info
        };
        P::clock_enable(&sys_info).map_err(|_| BootError::BadObjectState)?;

        let idle_stack = alloc_stack(self.cfg.idle_stack_size)?;
        let main_stack = alloc_stack(self.cfg.main_stack_size)?;

        let mut lock = klock::lock_cpu::<P>()?;
        let spawn_err = |e: CreateThreadError| match e {
            CreateThreadError::BadContext => BootError::BadContext,
            CreateThreadError::NoMemory => BootError::NoMemory,
            CreateThreadError::BadParam => BootError::BadObjectState,
        };
        let idle = self
            .spawn(lock.borrow_mut(), "idle", idle_main::<P>, 0, idle_stack, PRIO_LOWEST)
            .map_err(spawn_err)?;
        let main = self
            .spawn(
                lock.borrow_mut(),
                self.cfg.main_name,
                main,
                arg,
                main_stack,
                self.cfg.main_priority,
            )
            .map_err(spawn_err)?;

        let sched = self.state.write(&mut *lock);
        sched.threads[idle].is_idle = true;
        sched.idle = Some(idle);
        sched.dispatch_first(main);
        let incoming = sched.context_ptr(main);

        log::debug!("booting; dispatching {:?}", main);

        // CPU Lock is handed over to the main thread
        mem::forget(lock);

        // Safety: CPU Lock active, `incoming` is alive
        unsafe { P::dispatch_first_thread(incoming) };
        Ok(())
    }

    /// Create a thread and make it ready to run. The caller is not preempted
    /// by the new thread; it runs at the next scheduling point.
    pub fn thread_create(
        &'static self,
        name: &str,
        entry: ThreadEntry<P>,
        arg: usize,
        stack_size: usize,
        priority: Priority,
    ) -> Result<ThreadId, CreateThreadError> {
        if priority == PRIO_LOWEST || stack_size == 0 || name.len() > THREAD_NAME_LEN {
            return Err(CreateThreadError::BadParam);
        }
        let stack = alloc_stack(stack_size)?;
        let mut lock = klock::lock_cpu::<P>()?;
        let thread = self.spawn(lock.borrow_mut(), name, entry, arg, stack, priority)?;
        self.unlock_cpu_and_check_preemption(lock);
        Ok(thread)
    }

    fn spawn(
        &'static self,
        mut lock: klock::CpuLockTokenRefMut<'_, P>,
        name: &str,
        entry: ThreadEntry<P>,
        arg: usize,
        mut stack: Box<[u8]>,
        priority: Priority,
    ) -> Result<ThreadId, CreateThreadError> {
        let name = ArrayString::from(name).map_err(|_| CreateThreadError::BadParam)?;
        let sched = self.state.write(&mut *lock);

        let join_queue = sched.create_queue();
        let thread = sched
            .threads
            .insert(ThreadCb::new(name, priority, entry, arg, join_queue));

        let start = ThreadStart {
            kernel: self,
            thread,
        };
        match P::prepare_stack(&mut stack, start) {
            Ok(context) => {
                let cb = &mut sched.threads[thread];
                cb.context = Some(ContextPtr::new(context));
                cb.stack = Some(stack);
            }
            Err(e) => {
                sched.threads.remove(thread);
                sched.queues.remove(join_queue);
                return Err(e.into());
            }
        }

        sched.make_runnable(thread);
        log::debug!("created {:?} ({}, priority {})", thread, name, priority);
        Ok(thread)
    }

    /// Destroy a thread. The thread must not be the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already destroyed, is the current thread, or
    /// is the idle thread.
    pub fn thread_destroy(&'static self, thread: ThreadId) -> Result<(), DestroyThreadError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self, lock.borrow_mut())?;
        let remains = self.state.write(&mut *lock).destroy_thread(thread);
        self.unlock_cpu_and_check_preemption(lock);
        remains.release();
        Ok(())
    }

    /// Destroy the first thread named `name`.
    pub fn thread_destroy_by_name(&'static self, name: &str) -> Result<(), DestroyThreadError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self, lock.borrow_mut())?;
        let sched = self.state.write(&mut *lock);
        let thread = sched
            .thread_by_name(name)
            .ok_or(DestroyThreadError::BadParam)?;
        let remains = sched.destroy_thread(thread);
        self.unlock_cpu_and_check_preemption(lock);
        remains.release();
        Ok(())
    }

    /// Wait until `thread` exits, and reclaim it. Returns immediately if the
    /// thread no longer exists.
    pub fn join(&'static self, thread: ThreadId) -> Result<(), JoinError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self, lock.borrow_mut())?;
        if self.state.read(&*lock).current == Some(thread) {
            return Err(JoinError::BadParam);
        }

        let remains = loop {
            let sched = self.state.write(&mut *lock);
            match sched.threads.get(thread) {
                None => break None,
                Some(t) if t.state == RunState::Exited => {
                    break Some(sched.destroy_thread(thread));
                }
                Some(t) => {
                    let join_queue = t.join_queue;
                    expect_not_timeout(self.wait_queue(lock.borrow_mut(), join_queue, None));
                }
            }
        };

        self.unlock_cpu_and_check_preemption(lock);
        if let Some(remains) = remains {
            remains.release();
        }
        Ok(())
    }

    /// Terminate the current thread. Only returns on error.
    pub fn exit_thread(&'static self) -> Result<Infallible, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self, lock.borrow_mut())?;

        let sched = self.state.write(&mut *lock);
        let (from, to) = sched.exit_current();
        let outgoing = sched.context_ptr(from);
        let incoming = sched.context_ptr(to);
        log::debug!("{:?} exited; dispatching {:?}", from, to);

        // CPU Lock is handed over to the incoming thread
        mem::forget(lock);

        // Safety: CPU Lock active, both contexts are alive
        unsafe { P::exit_and_dispatch(outgoing, incoming) }
    }

    /// Get the current thread.
    pub fn current_thread(&self) -> Result<ThreadId, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        self.state
            .read(&*lock)
            .current
            .ok_or(BadContextError::BadContext)
    }

    /// Get the run state of a thread. Returns `None` if the thread doesn't
    /// exist anymore.
    pub fn thread_state(&self, thread: ThreadId) -> Result<Option<RunState>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).threads.get(thread).map(|t| t.state))
    }

    /// Get the base priority of a thread. Returns `None` if the thread doesn't
    /// exist anymore.
    pub fn thread_priority(&self, thread: ThreadId) -> Result<Option<Priority>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).threads.get(thread).map(|t| t.priority))
    }

    /// Let a thread of equal or higher priority run, if any is ready.
    pub fn yield_now(&'static self) -> Result<(), YieldError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self, lock.borrow_mut())?;
        self.unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Block the current thread for at least `ms` milliseconds. `0` only
    /// yields.
    pub fn sleep(&'static self, ms: u32) -> Result<(), SleepError> {
        if ms == 0 {
            self.yield_now().map_err(|YieldError::BadContext| SleepError::BadContext)?;
            return Ok(());
        }
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self, lock.borrow_mut())?;
        let sched = self.state.write(&mut *lock);
        let ticks = sched.clocks[sched.sys_clock.0].ms_to_ticks(ms);
        sched.sleep_current(ticks);
        self.schedule(lock.borrow_mut());
        self.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Change the base priority of the current thread. Returns the previous
    /// priority. Followed by a yield point.
    pub fn nice(&'static self, priority: Priority) -> Result<Priority, NiceError> {
        if priority == PRIO_LOWEST {
            return Err(NiceError::BadParam);
        }
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self, lock.borrow_mut())?;
        let sched = self.state.write(&mut *lock);
        let current = sched.current();
        let thread = &mut sched.threads[current];
        let old = mem::replace(&mut thread.priority, priority);
        thread.dyn_priority = priority;
        log::trace!("{:?}: priority {} -> {}", current, old, priority);
        self.unlock_cpu_and_yield(lock);
        Ok(old)
    }

    /// Block the current thread until [`Self::unpark`] is called on it. If a
    /// token is already available, consume it and return immediately.
    pub fn park(&'static self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_waitable_context(self, lock.borrow_mut())?;
        if self.state.write(&mut *lock).park_current() {
            self.schedule(lock.borrow_mut());
        }
        self.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Wake a parked thread, or give it a token that makes its next
    /// [`Self::park`] return immediately.
    pub fn unpark(&'static self, thread: ThreadId) -> Result<(), UnparkError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self, lock.borrow_mut())?;
        self.state.write(&mut *lock).unpark(thread)?;
        self.unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Set the deadline of the current thread to `ms` milliseconds from now,
    /// or clear it. Requires [`SchedPolicy::EarliestDeadlineFirst`].
    ///
    /// [`SchedPolicy::EarliestDeadlineFirst`]: crate::SchedPolicy::EarliestDeadlineFirst
    pub fn set_deadline(&'static self, ms: Option<u32>) -> Result<(), SetDeadlineError> {
        let mut lock = klock::lock_cpu::<P>()?;
        state::expect_thread_context(self, lock.borrow_mut())?;
        let sched = self.state.write(&mut *lock);
        if sched.policy != crate::SchedPolicy::EarliestDeadlineFirst {
            return Err(SetDeadlineError::BadObjectState);
        }
        let clock = &sched.clocks[sched.sys_clock.0];
        let deadline = ms.map(|ms| clock.ticks() + u64::from(clock.ms_to_ticks(ms)));
        let current = sched.current();
        sched.threads[current].deadline = deadline;
        self.unlock_cpu_and_yield(lock);
        Ok(())
    }

    /// Get the threads in the run queue, in dispatch order. The current
    /// thread is not included.
    pub fn run_queue(&self) -> Result<Vec<ThreadId>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        let sched = self.state.read(&*lock);
        Ok(sched.rq.iter(&sched.threads).collect())
    }

    /// Log the run queue at the debug level.
    pub fn dump_run_queue(&self) -> Result<(), BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        let sched = self.state.read(&*lock);
        log::debug!("current: {:?}", sched.current);
        for thread in sched.rq.iter(&sched.threads) {
            let cb = &sched.threads[thread];
            log::debug!(
                "  {:?} {:<16} prio {:3} dyn {:3} {:?}",
                thread,
                cb.name.as_str(),
                cb.priority,
                cb.dyn_priority,
                cb.state
            );
        }
        Ok(())
    }

    /// Get the number of context switches so far.
    pub fn switch_count(&self) -> Result<u64, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).rq.switch_count)
    }
}
