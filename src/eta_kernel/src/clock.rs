//! Clock sources
use crate::{
    error::{BadParamError, InitClockError},
    klock,
    timer::TimerId,
    BadContextError, Isr, Kernel, Port,
};

/// Identifies a clock source of a kernel. Clock sources are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(pub(crate) usize);

/// The static properties of a clock source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockInfo {
    pub name: &'static str,
    /// Ticks per second.
    pub freq: u32,
}

/// *Clock source control block*
///
/// The tick count is a wrapping `u32`. Timers are processed lazily: the
/// count advances in interrupt handlers, and the delta list catches up by
/// the difference since the last processing (`tc_update`), which is
/// well-defined across an overflow.
#[derive(Debug)]
pub(crate) struct ClockSource {
    pub(crate) info: ClockInfo,
    count: u32,
    /// The number of times `count` overflowed.
    epoch: u32,
    /// The value of `count` when the delta list was last processed.
    tc_update: u32,
    /// Head of the delta list of timers.
    pub(crate) timers: Option<TimerId>,
    /// Head of the absolute-time list of high-resolution timers.
    pub(crate) hrtimers: Option<TimerId>,
}

impl ClockSource {
    pub(crate) fn new(info: ClockInfo) -> Self {
        Self {
            info,
            count: 0,
            epoch: 0,
            tc_update: 0,
            timers: None,
            hrtimers: None,
        }
    }

    pub(crate) fn tick(&mut self) {
        let (count, overflow) = self.count.overflowing_add(1);
        self.count = count;
        if overflow {
            self.epoch = self.epoch.wrapping_add(1);
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// The total number of ticks since the clock source was started.
    pub(crate) fn ticks(&self) -> u64 {
        (u64::from(self.epoch) << 32) | u64::from(self.count)
    }

    /// Ticks not yet accounted for in the delta list.
    pub(crate) fn pending(&self) -> u32 {
        self.count.wrapping_sub(self.tc_update)
    }

    /// Take the ticks not yet accounted for in the delta list.
    pub(crate) fn take_pending(&mut self) -> u32 {
        let diff = self.pending();
        self.tc_update = self.count;
        diff
    }

    /// Convert milliseconds to ticks, rounding up.
    pub(crate) fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = (u64::from(ms) * u64::from(self.info.freq) + 999) / 1000;
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    #[cfg(test)]
    pub(crate) fn set_count(&mut self, count: u32) {
        self.count = count;
        self.tc_update = count;
    }
}

impl<P: Port> Kernel<P> {
    /// Get the system clock, which drives sleeping, timeouts and time slices.
    pub fn system_clock(&self) -> ClockId {
        ClockId(0)
    }

    /// Register and start a clock source.
    pub fn clock_source_init(
        &'static self,
        name: &'static str,
        freq: u32,
    ) -> Result<ClockId, InitClockError> {
        if freq == 0 {
            return Err(BadParamError::BadParam.into());
        }
        let info = ClockInfo { name, freq };
        {
            let lock = klock::lock_cpu::<P>()?;
            if self.clock_source_by_name_inner(&lock, name).is_some() {
                return Err(InitClockError::BadParam);
            }
        }

        P::clock_enable(&info)?;

        let mut lock = klock::lock_cpu::<P>()?;
        let clocks = &mut self.state.write(&mut *lock).clocks;
        clocks.push(ClockSource::new(info));
        log::debug!("clock source '{}' ({} Hz) registered", name, freq);
        Ok(ClockId(clocks.len() - 1))
    }

    fn clock_source_by_name_inner(
        &self,
        lock: &klock::CpuLockGuard<P>,
        name: &str,
    ) -> Option<ClockId> {
        self.state
            .read(&**lock)
            .clocks
            .iter()
            .position(|c| c.info.name == name)
            .map(ClockId)
    }

    /// Find a clock source by name.
    pub fn clock_source_by_name(&self, name: &str) -> Result<Option<ClockId>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.clock_source_by_name_inner(&lock, name))
    }

    /// Get the properties of a clock source.
    pub fn clock_source_info(&self, clock: ClockId) -> Result<ClockInfo, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).clocks[clock.0].info)
    }

    /// Get the total number of ticks of a clock source.
    pub fn clock_source_get_ticks(&self, clock: ClockId) -> Result<u64, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).clocks[clock.0].ticks())
    }

    /// Get the number of whole seconds a clock source has been running.
    pub fn clock_source_get_seconds(&self, clock: ClockId) -> Result<u64, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        let source = &self.state.read(&*lock).clocks[clock.0];
        Ok(source.ticks() / u64::from(source.info.freq))
    }

    /// Advance a clock source by one tick. Called from the clock's interrupt
    /// handler.
    ///
    /// Delta-list timers are processed at the next scheduling point. On the
    /// system clock, this also consumes the current thread's time slice.
    pub fn clock_tick(&self, isr: Isr<'_, P>, clock: ClockId) {
        let _ = isr;
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            log::warn!("clock_tick called with CPU Lock active");
            return;
        };
        let sched = self.state.write(&mut *lock);
        sched.clocks[clock.0].tick();

        #[cfg(feature = "preempt")]
        if clock == sched.sys_clock {
            sched.tick_slice();
        }
    }

    /// Advance a clock source by one tick and fire its expired
    /// high-resolution timers right away.
    pub fn hrtimer_tick(&'static self, isr: Isr<'_, P>, clock: ClockId) {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            log::warn!("hrtimer_tick called with CPU Lock active");
            return;
        };
        let sched = self.state.write(&mut *lock);
        sched.clocks[clock.0].tick();
        sched.process_hrtimers(clock);
        let expired = core::mem::take(&mut sched.expired);
        drop(lock);

        for (callback, arg) in expired {
            callback(isr, arg);
        }
    }

    /// Return `true` if any timer is armed. With nothing armed and every
    /// thread blocked, the system can only be woken by an interrupt handler.
    pub fn timers_pending(&self) -> Result<bool, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.state.read(&*lock).timers_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing, testing::NullPort, TimerFlags};
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn source(freq: u32) -> ClockSource {
        ClockSource::new(ClockInfo { name: "test", freq })
    }

    #[test]
    fn ms_to_ticks_rounds_up() {
        let c = source(1000);
        assert_eq!(c.ms_to_ticks(0), 0);
        assert_eq!(c.ms_to_ticks(7), 7);

        let c = source(100);
        assert_eq!(c.ms_to_ticks(1), 1);
        assert_eq!(c.ms_to_ticks(10), 1);
        assert_eq!(c.ms_to_ticks(11), 2);

        let c = source(u32::MAX);
        assert_eq!(c.ms_to_ticks(u32::MAX), u32::MAX);
    }

    #[test]
    fn pending_survives_overflow() {
        let mut c = source(1000);
        c.set_count(u32::MAX - 1);
        for _ in 0..4 {
            c.tick();
        }
        assert_eq!(c.count(), 2);
        assert_eq!(c.pending(), 4);
        assert_eq!(c.ticks(), (1 << 32) + 2);
        assert_eq!(c.take_pending(), 4);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn timers_fire_across_overflow() {
        let mut sched = testing::scheduler();
        let main = testing::spawn(&mut sched, "main", 120);
        sched.dispatch_first(main);
        sched.clocks[0].set_count(u32::MAX - 2);

        sched.sleep_current(5);
        testing::advance(&mut sched, 4);
        assert_eq!(sched.threads[main].state, crate::RunState::Sleeping);
        testing::advance(&mut sched, 1);
        assert_eq!(sched.threads[main].state, crate::RunState::Running);
    }

    #[test]
    fn clock_source_init_registers_clock() {
        let (kernel, _) = testing::kernel();
        let aux = kernel.clock_source_init("aux", 32768).unwrap();
        assert_ne!(aux, kernel.system_clock());
        assert_eq!(kernel.clock_source_by_name("aux").unwrap(), Some(aux));
        assert_eq!(kernel.clock_source_info(aux).unwrap().freq, 32768);
        assert_eq!(kernel.clock_source_get_ticks(aux).unwrap(), 0);

        assert_eq!(kernel.clock_source_init("aux", 100), Err(InitClockError::BadParam));
        assert_eq!(kernel.clock_source_init("slow", 0), Err(InitClockError::BadParam));
    }

    #[test]
    fn clock_enable_failure_is_reported() {
        let (kernel, _) = testing::kernel();
        assert_eq!(
            kernel.clock_source_init("broken", 100),
            Err(InitClockError::BadObjectState)
        );
        assert_eq!(kernel.clock_source_by_name("broken").unwrap(), None);
    }

    static HR_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn on_hrtimer(isr: Isr<'_, NullPort>, arg: usize) {
        assert!(isr.kernel().is_interrupt_context());
        HR_FIRED.fetch_add(arg, Ordering::Relaxed);
    }

    #[test]
    fn hrtimer_tick_fires_from_interrupt_context() {
        let (kernel, _) = testing::kernel();
        let hr = kernel.clock_source_init("hr", 1000).unwrap();
        let one_shot = kernel
            .timer_create(
                hr,
                2,
                on_hrtimer,
                5,
                TimerFlags::HIGH_RESOLUTION | TimerFlags::ONE_SHOT,
            )
            .unwrap();

        // Safety: `NullPort` never takes CPU Lock across this
        let isr = unsafe { kernel.enter_isr() };
        kernel.hrtimer_tick(isr, hr);
        assert_eq!(HR_FIRED.load(Ordering::Relaxed), 0);
        kernel.hrtimer_tick(isr, hr);
        assert_eq!(HR_FIRED.load(Ordering::Relaxed), 5);
        kernel.isr_nesting.fetch_sub(1, Ordering::Relaxed);

        assert_eq!(kernel.clock_source_get_ticks(hr).unwrap(), 2);
        assert!(!kernel.timer_cancel(one_shot).unwrap());
        assert!(!kernel.timers_pending().unwrap());
    }

    #[test]
    fn system_clock_is_first() {
        let kernel = Kernel::<NullPort>::new(crate::KernelCfg::new().tick_freq(250));
        assert_eq!(kernel.system_clock(), ClockId(0));
        let sched = testing::scheduler_with(crate::KernelCfg::new().tick_freq(250));
        assert_eq!(sched.clocks[0].info.freq, 250);
    }
}
