//! Timers
//!
//! Each clock source keeps two timer lists:
//!
//!  - The *delta list*, where each entry stores its remaining ticks relative
//!    to its predecessor. It's processed lazily at scheduling points by
//!    consuming the ticks elapsed since the last processing.
//!  - The *high-resolution list*, sorted by absolute expiry, processed
//!    immediately by [`Kernel::hrtimer_tick`].
//!
//! Kernel-internal timers (sleeps and wait timeouts) act on the scheduler
//! directly. User timers run a callback in an interrupt context, outside CPU
//! Lock.
use bitflags::bitflags;
use core::fmt;

use crate::{
    clock::ClockId,
    error::{BadParamError, CreateTimerError},
    klock,
    sched::Scheduler,
    thread::ThreadId,
    utils::define_key,
    BadContextError, Isr, Kernel, Port,
};

define_key! {
    /// Identifies a timer.
    pub struct TimerId;
}

/// A timer callback. Runs in an interrupt context.
pub type TimerCallback<P> = fn(Isr<'_, P>, usize);

bitflags! {
    /// Options for [`Kernel::timer_create`].
    pub struct TimerFlags: u8 {
        /// Fire once, then free the timer. Otherwise the timer fires
        /// periodically until cancelled.
        const ONE_SHOT = 1 << 0;
        /// Put the timer on the high-resolution list, fired by
        /// [`Kernel::hrtimer_tick`] instead of at scheduling points.
        const HIGH_RESOLUTION = 1 << 1;
    }
}

/// What happens when a timer fires.
pub(crate) enum TimerAction<P: Port> {
    WaitTimeout(ThreadId),
    Sleep(ThreadId),
    Callback { callback: TimerCallback<P>, arg: usize },
}

impl<P: Port> Clone for TimerAction<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for TimerAction<P> {}

impl<P: Port> fmt::Debug for TimerAction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitTimeout(thread) => f.debug_tuple("WaitTimeout").field(thread).finish(),
            Self::Sleep(thread) => f.debug_tuple("Sleep").field(thread).finish(),
            Self::Callback { arg, .. } => f.debug_struct("Callback").field("arg", arg).finish(),
        }
    }
}

/// *Timer control block*
#[derive(Debug)]
pub(crate) struct TimerCb<P: Port> {
    clock: ClockId,
    /// Delta list: ticks remaining after the predecessor expires.
    tleft: u32,
    /// High-resolution list: the clock count at which the timer expires.
    expire_at: u32,
    /// The period. Zero for a one-shot timer.
    interval: u32,
    high_resolution: bool,
    action: TimerAction<P>,
    prev: Option<TimerId>,
    next: Option<TimerId>,
}

/// Return `true` if `a` is at or after `b`, assuming they're less than
/// 2³¹ ticks apart.
fn time_at_or_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

impl<P: Port> Scheduler<P> {
    /// Create a one-shot timer for kernel-internal use.
    pub(crate) fn timer_create_internal(
        &mut self,
        clock: ClockId,
        ticks: u32,
        action: TimerAction<P>,
    ) -> TimerId {
        self.timer_create(clock, ticks, 0, false, action)
    }

    pub(crate) fn timer_create(
        &mut self,
        clock: ClockId,
        ticks: u32,
        interval: u32,
        high_resolution: bool,
        action: TimerAction<P>,
    ) -> TimerId {
        let id = self.timers.insert(TimerCb {
            clock,
            tleft: ticks,
            expire_at: 0,
            interval,
            high_resolution,
            action,
            prev: None,
            next: None,
        });
        if high_resolution {
            let expire_at = self.clocks[clock.0].count().wrapping_add(ticks);
            self.hrtimer_insert(id, expire_at);
        } else {
            self.delta_insert(id, ticks);
        }
        id
    }

    /// Link a timer into its clock's delta list, `ticks` from now.
    fn delta_insert(&mut self, id: TimerId, ticks: u32) {
        let clock = self.timers[id].clock;

        // The list hasn't caught up with the ticks elapsed since it was last
        // processed. Those ticks will be subtracted from the head, so account
        // for them here.
        let tleft = ticks.saturating_add(self.clocks[clock.0].pending());
        self.delta_link(id, tleft);
    }

    /// Link a timer into its clock's delta list, `tleft` ticks after the
    /// list's origin.
    fn delta_link(&mut self, id: TimerId, mut tleft: u32) {
        let clock = self.timers[id].clock;
        let mut prev = None;
        let mut cursor = self.clocks[clock.0].timers;
        while let Some(c) = cursor {
            let t = &self.timers[c];
            if tleft < t.tleft {
                break;
            }
            tleft -= t.tleft;
            prev = Some(c);
            cursor = t.next;
        }

        if let Some(next) = cursor {
            self.timers[next].tleft -= tleft;
            self.timers[next].prev = Some(id);
        }
        let timer = &mut self.timers[id];
        timer.tleft = tleft;
        timer.prev = prev;
        timer.next = cursor;
        match prev {
            Some(p) => self.timers[p].next = Some(id),
            None => self.clocks[clock.0].timers = Some(id),
        }
    }

    /// Link a high-resolution timer into its clock's list, ordered by expiry.
    fn hrtimer_insert(&mut self, id: TimerId, expire_at: u32) {
        let clock = self.timers[id].clock;
        let now = self.clocks[clock.0].count();
        let key = expire_at.wrapping_sub(now);

        let mut prev = None;
        let mut cursor = self.clocks[clock.0].hrtimers;
        while let Some(c) = cursor {
            let t = &self.timers[c];
            if key < t.expire_at.wrapping_sub(now) {
                break;
            }
            prev = Some(c);
            cursor = t.next;
        }

        if let Some(next) = cursor {
            self.timers[next].prev = Some(id);
        }
        let timer = &mut self.timers[id];
        timer.expire_at = expire_at;
        timer.prev = prev;
        timer.next = cursor;
        match prev {
            Some(p) => self.timers[p].next = Some(id),
            None => self.clocks[clock.0].hrtimers = Some(id),
        }
    }

    /// Unlink a timer from whichever list it's on.
    fn timer_unlink(&mut self, id: TimerId) {
        let timer = &self.timers[id];
        let (clock, prev, next, tleft) = (timer.clock, timer.prev, timer.next, timer.tleft);
        let high_resolution = timer.high_resolution;

        if let Some(next) = next {
            let n = &mut self.timers[next];
            n.prev = prev;
            if !high_resolution {
                // The successor's delta now covers the removed entry's span
                n.tleft += tleft;
            }
        }
        match prev {
            Some(p) => self.timers[p].next = next,
            None if high_resolution => self.clocks[clock.0].hrtimers = next,
            None => self.clocks[clock.0].timers = next,
        }

        let timer = &mut self.timers[id];
        timer.prev = None;
        timer.next = None;
    }

    /// Cancel and free a timer. Return `false` if it already fired (one-shot)
    /// or was cancelled.
    pub(crate) fn timer_cancel(&mut self, id: TimerId) -> bool {
        if !self.timers.contains(id) {
            return false;
        }
        self.timer_unlink(id);
        self.timers.remove(id);
        true
    }

    /// Fire the timers of `clock`'s delta list that expired since the last
    /// processing.
    pub(crate) fn process_clock(&mut self, clock: ClockId) {
        let mut diff = self.clocks[clock.0].take_pending();

        while let Some(head) = self.clocks[clock.0].timers {
            let timer = &mut self.timers[head];
            if diff < timer.tleft {
                timer.tleft -= diff;
                break;
            }
            diff -= timer.tleft;
            timer.tleft = 0;

            self.timer_unlink(head);
            self.timer_fire(head);
        }
    }

    /// Fire the expired timers of `clock`'s high-resolution list.
    pub(crate) fn process_hrtimers(&mut self, clock: ClockId) {
        let now = self.clocks[clock.0].count();
        while let Some(head) = self.clocks[clock.0].hrtimers {
            if !time_at_or_after(now, self.timers[head].expire_at) {
                break;
            }
            self.timer_unlink(head);
            self.timer_fire(head);
        }
    }

    /// Run a timer's action. The timer is already unlinked. A periodic timer
    /// is rearmed relative to its expiry, not to the current time, so it
    /// doesn't drift.
    fn timer_fire(&mut self, id: TimerId) {
        let timer = &self.timers[id];
        let (action, interval) = (timer.action, timer.interval);
        let (high_resolution, expire_at) = (timer.high_resolution, timer.expire_at);

        if interval == 0 {
            self.timers.remove(id);
        } else if high_resolution {
            self.hrtimer_insert(id, expire_at.wrapping_add(interval));
        } else {
            // The list's origin is this timer's expiry
            self.delta_link(id, interval);
        }

        match action {
            TimerAction::WaitTimeout(thread) => self.wait_timeout_expired(thread, id),
            TimerAction::Sleep(thread) => self.sleep_expired(thread, id),
            TimerAction::Callback { callback, arg } => self.expired.push((callback, arg)),
        }
    }

    pub(crate) fn timers_pending(&self) -> bool {
        self.timers.len() != 0
    }
}

impl<P: Port> Kernel<P> {
    /// Create a timer on `clock` that calls `callback` with `arg` after `ms`
    /// milliseconds, and then every `ms` milliseconds unless
    /// [`TimerFlags::ONE_SHOT`] is given.
    ///
    /// The callback runs in an interrupt context.
    pub fn timer_create(
        &'static self,
        clock: ClockId,
        ms: u32,
        callback: TimerCallback<P>,
        arg: usize,
        flags: TimerFlags,
    ) -> Result<TimerId, CreateTimerError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let sched = self.state.write(&mut *lock);
        let ticks = sched.clocks[clock.0].ms_to_ticks(ms);
        let one_shot = flags.contains(TimerFlags::ONE_SHOT);
        if !one_shot && ticks == 0 {
            return Err(BadParamError::BadParam.into());
        }

        let interval = if one_shot { 0 } else { ticks };
        let high_resolution = flags.contains(TimerFlags::HIGH_RESOLUTION);
        let id = sched.timer_create(
            clock,
            ticks,
            interval,
            high_resolution,
            TimerAction::Callback { callback, arg },
        );
        log::trace!("{:?} created ({} ticks, {:?})", id, ticks, flags);
        Ok(id)
    }

    /// Cancel a timer. Returns `false` if the timer already fired (one-shot)
    /// or was cancelled before; cancelling twice is harmless.
    pub fn timer_cancel(&'static self, timer: TimerId) -> Result<bool, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        Ok(self.state.write(&mut *lock).timer_cancel(timer))
    }
}
