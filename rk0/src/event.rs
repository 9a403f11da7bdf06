//! C11: per-task event flags.
//!
//! Grounded on `original_source/core/src/ktaskflags.c`. Unlike the
//! synchronization primitives in [`crate::semaphore`]/[`crate::mutex`],
//! there is no separate kernel object here — every [`crate::task::TaskCb`]
//! already carries its own `required_flags`/`current_flags`/
//! `flags_wait_mode` fields (`spec.md` §4.9), so this module is just the
//! operations over those fields.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::klock;
use crate::kernel::Kernel;
use crate::task::{FlagsWaitMode, TaskIdx, TaskState};
use crate::time::{self, Tick, NO_WAIT, WAIT_FOREVER};
use crate::timeout::{Owner, TimeoutKind};

fn condition_met(current: u32, required: u32, mode: FlagsWaitMode) -> bool {
    match mode {
        FlagsWaitMode::All => (current & required) == required,
        FlagsWaitMode::Any => (current & required) != 0,
    }
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// Wait for `required` event bits on the calling task's own register.
    /// `required` must be nonzero. On success the bits named by `required`
    /// (not the full current register) are cleared, matching the original
    /// clearing only `flagsReq`, not every bit the caller asked about that
    /// happened to already be zero.
    pub fn event_get(&mut self, required: u32, mode: FlagsWaitMode, timeout: Tick) -> Result<u32> {
        if P::is_isr() {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        if required == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        time::validate_timeout(timeout).map_err(|e| self.raise(e))?;

        let _guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let cur = self.current();

        let tcb = self.task_mut(cur);
        tcb.required_flags = required;
        tcb.flags_wait_mode = mode;
        let got_before = tcb.current_flags;

        if condition_met(got_before, required, mode) {
            let tcb = self.task_mut(cur);
            tcb.current_flags &= !tcb.required_flags;
            tcb.required_flags = 0;
            return Ok(got_before);
        }

        if timeout == NO_WAIT {
            return Err(Error::FlagsNotMet);
        }

        self.task_mut(cur).status = TaskState::Blocked;
        if timeout != WAIT_FOREVER {
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
            // Safety: `cur`'s `timeout_node` outlives this wait.
            unsafe {
                self.delta.insert(node, TimeoutKind::EventFlags, Owner::Task(cur), timeout);
            }
        }

        drop(_guard);
        P::pend_context_switch();

        let _guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");

        if self.task(cur).timed_out {
            self.task_mut(cur).timed_out = false;
            return Err(Error::Timeout);
        }

        let tcb = self.task_mut(cur);
        let got = tcb.current_flags;
        tcb.current_flags &= !tcb.required_flags;
        tcb.required_flags = 0;
        Ok(got)
    }

    /// OR `mask` into `target`'s current flags; if `target` is blocked
    /// waiting on flags and its condition is now met, ready it. `mask == 0`
    /// is rejected.
    pub fn event_set(&mut self, target: TaskIdx, mask: u32) -> Result<()> {
        if mask == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        let _guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");

        let tcb = self.task_mut(target);
        tcb.current_flags |= mask;
        let pending = tcb.status == TaskState::Blocked && tcb.required_flags != 0;
        if pending {
            let required = tcb.required_flags;
            let mode = tcb.flags_wait_mode;
            let met = condition_met(tcb.current_flags, required, mode);
            if met {
                if self.task(target).timeout_node.is_linked() {
                    let node = &mut self.tasks[target.0 as usize].timeout_node as *mut _;
                    unsafe { self.delta.remove(node) };
                }
                drop(_guard);
                self.make_ready(target);
                self.reschedule();
                return Ok(());
            }
        }
        Ok(())
    }

    /// AND-NOT `mask` out of `target`'s current flags. Has no effect on a
    /// waiter already blocked — a clear never un-satisfies a condition a
    /// waiter will observe on its own next check.
    pub fn event_clear(&mut self, target: TaskIdx, mask: u32) -> Result<()> {
        if P::is_isr() {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        let _guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        self.task_mut(target).current_flags &= !mask;
        Ok(())
    }

    pub fn event_query(&mut self, target: TaskIdx) -> u32 {
        let _guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        self.task(target).current_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn any_wakes_on_first_overlapping_bit_and_clears_only_required() {
        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        let t = TaskIdx(0);
        k.task_mut(t).current_flags = 0b0010;
        k.current = Some(t);
        let got = k.event_get(0b1010, FlagsWaitMode::Any, NO_WAIT).unwrap();
        assert_eq!(got, 0b0010);
        assert_eq!(k.event_query(t), 0);
    }

    #[test]
    fn all_requires_every_bit() {
        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        let t = TaskIdx(0);
        k.current = Some(t);
        k.task_mut(t).current_flags = 0b0010;
        assert_eq!(k.event_get(0b1010, FlagsWaitMode::All, NO_WAIT), Err(Error::FlagsNotMet));
        k.task_mut(t).current_flags |= 0b1000;
        assert_eq!(k.event_get(0b1010, FlagsWaitMode::All, NO_WAIT).unwrap(), 0b1010);
    }
}
