//! Tick-based time types (`spec.md` §4.4).
use rk0_port::Port;

use crate::error::Error;
use crate::kernel::Kernel;
use crate::klock;
use crate::task::TaskState;
use crate::timeout::{Owner, TimeoutKind};

/// A duration or absolute instant expressed in ticks.
pub type Tick = u32;

/// Try-only: never suspends the caller.
pub const NO_WAIT: Tick = 0;

/// Block indefinitely; never returns `Error::Timeout`.
pub const WAIT_FOREVER: Tick = u32::MAX;

/// Largest accepted bounded duration. Anything above this (other than
/// `WAIT_FOREVER`) is rejected as `Error::InvalidTimeout`.
pub const MAX_PERIOD: Tick = (1u32 << 31) - 1;

/// Validate a timeout argument per `spec.md` §4.4 / §8: `NO_WAIT` and
/// `WAIT_FOREVER` are always legal, anything else must be in
/// `1..=MAX_PERIOD`.
pub(crate) fn validate_timeout(timeout: Tick) -> crate::error::Result<()> {
    if timeout == NO_WAIT || timeout == WAIT_FOREVER || timeout <= MAX_PERIOD {
        Ok(())
    } else {
        Err(crate::error::Error::InvalidTimeout)
    }
}

/// Spin-wait against the raw tick counter, independent of the scheduler.
/// Does not suspend the caller and carries no scheduling semantics — it is
/// a polling helper, not a blocking primitive.
pub fn busy_wait<P: Port>(get_tick: impl Fn() -> Tick, ticks: Tick) -> crate::error::Result<()> {
    if ticks == 0 {
        return Err(crate::error::Error::InvalidParam);
    }
    let start = get_tick();
    let target = start.wrapping_add(ticks).wrapping_add(1);
    while get_tick().wrapping_sub(start) < target.wrapping_sub(start) {
        core::hint::spin_loop();
    }
    Ok(())
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// `kSleep`: suspend the calling task for exactly `ticks` ticks.
    pub fn sleep(&mut self, ticks: Tick) -> crate::error::Result<()> {
        if ticks == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        let cur = self.current();
        if self.task(cur).status != TaskState::Running {
            return Err(self.raise(Error::TaskInvalidState));
        }

        let guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
        // Safety: the running task's own timeout node outlives this wait.
        unsafe {
            self.delta.insert(node, TimeoutKind::TimeEvent, Owner::Task(cur), ticks);
        }
        self.task_mut(cur).status = TaskState::SleepDelay;
        drop(guard);
        P::pend_context_switch();
        Ok(())
    }

    /// `kSleepUntil`: anchor-relative periodic wait. `*anchor` holds the
    /// last wake time; on success it is advanced by exactly `period`, even
    /// if this call had to shorten its delay to catch up. An overrun of a
    /// full period or more is rejected rather than silently skipped, since
    /// unlike [`Self::sleep_periodic`] the anchor here is caller-owned and
    /// not aligned to a fixed grid.
    pub fn sleep_until(&mut self, anchor: &mut Tick, period: Tick) -> crate::error::Result<()> {
        if period == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        let now = self.tick_count();
        let mut target = anchor.wrapping_add(period);
        if now > target {
            let overrun = now.wrapping_sub(target);
            if overrun >= period {
                return Err(Error::ElapsedPeriod);
            }
            // Overrun by less than one period: shorten the delay to zero
            // rather than sleeping for a `target - now` that has already
            // passed (which would underflow into a multi-billion-tick
            // wait). The caller catches up immediately.
            target = now;
        }
        let delay = target.wrapping_sub(now);

        if delay > 0 {
            let cur = self.current();
            let guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
            // Safety: see `sleep`.
            unsafe {
                self.delta.insert(node, TimeoutKind::TimeEvent, Owner::Task(cur), delay);
            }
            self.task_mut(cur).status = TaskState::SleepUntil;
            drop(guard);
            P::pend_context_switch();
        }
        *anchor = target;
        Ok(())
    }

    /// `kSleepPeriodic`/`kSleepRelease`: like [`Self::sleep_until`] but the
    /// anchor lives in the TCB and is aligned to a global grid in multiples
    /// of `period` — an overrun of a full period or more skips ahead to the
    /// next grid slot instead of erroring.
    pub fn sleep_periodic(&mut self, period: Tick) -> crate::error::Result<()> {
        if period == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        let cur = self.current();
        let now = self.tick_count();
        let last = self.task(cur).last_wake_time;
        let mut target = last.wrapping_add(period);
        if now > target {
            let overrun = now.wrapping_sub(target);
            let periods_missed = overrun / period + 1;
            target = target.wrapping_add(periods_missed.wrapping_mul(period));
        }
        let delay = target.wrapping_sub(now);

        if delay > 0 {
            let guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
            // Safety: see `sleep`.
            unsafe {
                self.delta.insert(node, TimeoutKind::TimeEvent, Owner::Task(cur), delay);
            }
            self.task_mut(cur).status = TaskState::SleepUntil;
            drop(guard);
            P::pend_context_switch();
        }
        self.task_mut(cur).last_wake_time = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskIdx;

    struct HostPort;
    unsafe impl rk0_port::Port for HostPort {
        fn critical_enter() -> rk0_port::CriticalState {
            rk0_port::CriticalState(0)
        }
        unsafe fn critical_exit(_state: rk0_port::CriticalState) {}
        fn is_isr() -> bool {
            false
        }
        fn pend_context_switch() {}
        fn start_first_task() -> ! {
            loop {}
        }
        fn dmb() {}
        fn dsb() {}
        fn isb() {}
        fn wfi() {}
        unsafe fn init_task_stack(
            _stack: &mut [usize],
            _entry: unsafe extern "C" fn(*mut ()),
            _arg: *mut (),
        ) -> *mut usize {
            core::ptr::null_mut()
        }
        fn program_systick(_reload: u32, _tick_handler: fn() -> bool) {}
    }

    fn kernel_with_running_task() -> Kernel<HostPort, 2, 3> {
        let mut k: Kernel<HostPort, 2, 3> = Kernel::new();
        let tcb = k.task_mut(TaskIdx(0));
        tcb.priority = 1;
        tcb.base_priority = 1;
        tcb.status = TaskState::Running;
        k.current = Some(TaskIdx(0));
        k
    }

    /// anchor=1000, period=100, now=1150: overrun (50) is less than one
    /// period, so `sleep_until` must shorten the delay to zero instead of
    /// underflowing `target.wrapping_sub(now)` into a ~4.29 billion tick
    /// wait.
    #[test]
    fn sleep_until_shortens_small_overrun_instead_of_underflowing() {
        let mut k = kernel_with_running_task();
        k.tick = 1150;
        let mut anchor: Tick = 1000;
        assert!(k.sleep_until(&mut anchor, 100).is_ok());
        assert_eq!(anchor, 1150);
    }

    #[test]
    fn sleep_until_accepts_on_time_call() {
        let mut k = kernel_with_running_task();
        k.tick = 1050;
        let mut anchor: Tick = 1000;
        assert!(k.sleep_until(&mut anchor, 100).is_ok());
        assert_eq!(anchor, 1100);
    }

    #[test]
    fn sleep_until_rejects_full_period_overrun() {
        let mut k = kernel_with_running_task();
        k.tick = 1300;
        let mut anchor: Tick = 1000;
        assert_eq!(k.sleep_until(&mut anchor, 100), Err(Error::ElapsedPeriod));
        assert_eq!(anchor, 1000);
    }
}
