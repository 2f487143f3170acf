//! Static configuration of a kernel instance
use crate::{sched::SchedPolicy, thread::Priority};

/// The highest priority.
pub const PRIO_HIGHEST: Priority = 0;
/// Priority for latency-sensitive threads.
pub const PRIO_HIGH: Priority = 40;
/// The default priority. Used by the main thread unless configured otherwise.
pub const PRIO_DEFAULT: Priority = 120;
/// Priority for background work.
pub const PRIO_LOW: Priority = 200;
/// The lowest priority. Reserved for the idle thread.
pub const PRIO_LOWEST: Priority = 255;

/// The maximum length of a thread name in bytes.
pub const THREAD_NAME_LEN: usize = 16;

/// The default stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Configuration of a [`Kernel`](crate::Kernel), fixed at construction.
///
/// ```
/// use eta_kernel::{KernelCfg, SchedPolicy};
///
/// const CFG: KernelCfg = KernelCfg::new()
///     .tick_freq(1000)
///     .time_slice(5)
///     .policy(SchedPolicy::DynamicPriority);
/// assert_eq!(CFG.time_slice, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCfg {
    /// The frequency of the system clock in hertz.
    pub tick_freq: u32,
    /// The number of system ticks a thread may run before it's preempted in
    /// favor of a thread of equal priority. Only effective with the `preempt`
    /// feature.
    pub time_slice: u32,
    /// The scheduling policy.
    pub policy: SchedPolicy,
    /// The name of the main thread.
    pub main_name: &'static str,
    /// The priority of the main thread.
    pub main_priority: Priority,
    /// The stack size of the main thread.
    pub main_stack_size: usize,
    /// The stack size of the idle thread.
    pub idle_stack_size: usize,
    /// The seed of the pseudorandom generator used by
    /// [`SchedPolicy::Lottery`]. Must be non-zero.
    pub lottery_seed: u32,
}

impl KernelCfg {
    pub const fn new() -> Self {
        Self {
            tick_freq: 1000,
            time_slice: 10,
            policy: SchedPolicy::RoundRobin,
            main_name: "main",
            main_priority: PRIO_DEFAULT,
            main_stack_size: DEFAULT_STACK_SIZE,
            idle_stack_size: DEFAULT_STACK_SIZE,
            lottery_seed: 0x2545_f491,
        }
    }

    pub const fn tick_freq(self, tick_freq: u32) -> Self {
        Self { tick_freq, ..self }
    }

    pub const fn time_slice(self, time_slice: u32) -> Self {
        Self { time_slice, ..self }
    }

    pub const fn policy(self, policy: SchedPolicy) -> Self {
        Self { policy, ..self }
    }

    pub const fn main_thread(self, name: &'static str, priority: Priority) -> Self {
        Self {
            main_name: name,
            main_priority: priority,
            ..self
        }
    }

    pub const fn lottery_seed(self, lottery_seed: u32) -> Self {
        Self {
            lottery_seed,
            ..self
        }
    }
}

impl Default for KernelCfg {
    fn default() -> Self {
        Self::new()
    }
}
