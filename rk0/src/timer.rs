//! C14: callout timers.
//!
//! Grounded on `original_source/core/src/ktimer.c`'s `kTimerInit`/
//! `kTimerCancel` for the insertion/removal mechanics, and on
//! `original_source/core/src/ksch.c`'s `kTickHandler` for the phase/reload
//! relationship: a freshly initialized timer's first firing is delayed by
//! `phase` ticks before its `duration`-tick period starts counting, but a
//! reload never reapplies `phase` — each subsequent firing is exactly
//! `duration` ticks after the last (`spec.md` §9's open question, resolved
//! in favor of the simpler "phase is a one-time head start").
//!
//! Unlike the original, which keeps callout timers on their own delta-list
//! (`RK_gTimerListHeadPtr`) separate from task timeouts, this crate folds
//! both into [`crate::kernel::Kernel`]'s single [`crate::timeout::DeltaList`]
//! — one less piece of state to keep in sync, at the cost of needing to
//! stash which timer fired for the post-processing task to pick up (see
//! [`crate::postproc`]) instead of letting that task walk a second list
//! directly.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::klock::{self, CpuLockCell};
use crate::kernel::Kernel;
use crate::obj::ObjectKind;
use crate::postproc::JobKind;
use crate::time::Tick;
use crate::timeout::{Owner, TimeoutKind, TimeoutNode};

struct TimerState {
    init: bool,
    kind: ObjectKind,
    callback: Option<fn(*mut ())>,
    arg: *mut (),
    period: Tick,
    reload: bool,
    node: TimeoutNode,
}

/// A callout timer. Declared `'static` by the application, e.g.
/// `static BLINK: TimerCb<MyPort> = TimerCb::new();`.
pub struct TimerCb<P: Port> {
    inner: CpuLockCell<P, TimerState>,
}

// Safety: all access to `inner` goes through `CpuLockCell`.
unsafe impl<P: Port> Sync for TimerCb<P> {}

impl<P: Port> TimerCb<P> {
    pub const fn new() -> Self {
        Self {
            inner: CpuLockCell::new(TimerState {
                init: false,
                kind: ObjectKind::Timer,
                callback: None,
                arg: core::ptr::null_mut(),
                period: 0,
                reload: false,
                node: TimeoutNode::new(),
            }),
        }
    }

    fn check_init(st: &TimerState) -> Result<()> {
        if !st.init {
            return Err(Error::ObjectNotInit);
        }
        if st.kind != ObjectKind::Timer {
            return Err(Error::InvalidObject);
        }
        Ok(())
    }

    fn erased(&self) -> *mut () {
        self as *const Self as *mut ()
    }

    /// # Safety
    /// `ptr` must have come from [`Self::erased`] on a live `TimerCb<P>`
    /// with this same `P`.
    unsafe fn from_erased<'a>(ptr: *const ()) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }
}

impl<P: Port> Default for TimerCb<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// `kTimerInit`: arm `timer` to fire `callback(arg)` after `phase +
    /// duration` ticks the first time, then every `duration` ticks if
    /// `reload`. `duration == 0` is rejected; `phase == 0` is the common
    /// case of no initial offset.
    pub fn timer_init(
        &mut self,
        timer: &'static TimerCb<P>,
        phase: Tick,
        duration: Tick,
        callback: fn(*mut ()),
        arg: *mut (),
        reload: bool,
    ) -> Result<()> {
        if duration == 0 {
            return Err(self.raise(Error::InvalidParam));
        }
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = timer.inner.get_mut(&mut token);
        st.init = true;
        st.callback = Some(callback);
        st.arg = arg;
        st.period = duration;
        st.reload = reload;
        let node = &mut st.node as *mut _;
        drop(token);
        drop(guard);

        // Safety: `timer` is `'static`; its embedded node stays valid for
        // as long as it remains linked.
        unsafe {
            self.delta.insert(node, TimeoutKind::Call, Owner::Timer(timer.erased()), phase + duration);
        }
        Ok(())
    }

    /// `kTimerCancel`: unlink a pending timer early. No-op-ish error if it
    /// was not linked (already fired and not reloading, or never armed).
    pub fn timer_cancel(&mut self, timer: &'static TimerCb<P>) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = timer.inner.get_mut(&mut token);
        TimerCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        if !st.node.is_linked() {
            return Err(self.raise(Error::NotTimedOut));
        }
        let node = &mut st.node as *mut _;
        // Safety: just checked `is_linked`.
        unsafe { self.delta.remove(node) };
        Ok(())
    }

    pub fn timer_query(&mut self, timer: &'static TimerCb<P>) -> Result<bool> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = timer.inner.get_mut(&mut token);
        TimerCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        Ok(st.node.is_linked())
    }
}

/// Called from the tick handler (interrupt context) when a timer's
/// delta-list node expires. Queues the firing for the post-processing task
/// rather than invoking the callback here.
///
/// # Safety
/// `timer_ptr` must be the erased form of a live, initialized `TimerCb<P>`.
pub(crate) unsafe fn mark_due<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    timer_ptr: *mut (),
) {
    kernel.postproc_enqueue(JobKind::TimerDue, timer_ptr as *const (), 0);
}

/// Called from the post-processing task (task context) to actually run a
/// due timer's callback, and reinsert it if it reloads. The original
/// discards `phase` on reload — reinsertion always uses `period` alone.
///
/// # Safety
/// `timer_ptr` must be the erased form of a live, initialized `TimerCb<P>`.
pub(crate) unsafe fn run_due<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    timer_ptr: *const (),
) {
    // Safety: forwarded from `mark_due`'s precondition.
    let timer = unsafe { TimerCb::<P>::from_erased(timer_ptr) };

    let (callback, arg, period, reload) = {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = timer.inner.get_mut(&mut token);
        (st.callback, st.arg, st.period, st.reload)
    };

    if let Some(callback) = callback {
        callback(arg);
    }

    if reload {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = timer.inner.get_mut(&mut token);
        let node = &mut st.node as *mut _;
        drop(token);
        drop(guard);
        // Safety: `timer` is `'static`.
        unsafe {
            kernel.delta.insert(node, TimeoutKind::Call, Owner::Timer(timer.erased()), period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

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

    static HITS: AtomicU32 = AtomicU32::new(0);
    fn bump(_arg: *mut ()) {
        HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn one_shot_timer_fires_once_via_job_queue() {
        static TMR: TimerCb<HostPort> = TimerCb::new();
        let mut k: Kernel<HostPort, 1, 1> = Kernel::new();
        HITS.store(0, Ordering::Relaxed);

        k.timer_init(&TMR, 0, 3, bump, core::ptr::null_mut(), false).unwrap();
        for _ in 0..2 {
            k.tick();
        }
        assert_eq!(HITS.load(Ordering::Relaxed), 0);
        k.tick();
        k.postproc_drain_jobs();
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert!(!k.timer_query(&TMR).unwrap());
    }

    #[test]
    fn reload_timer_rearms_with_period_only() {
        static TMR: TimerCb<HostPort> = TimerCb::new();
        let mut k: Kernel<HostPort, 1, 1> = Kernel::new();
        HITS.store(0, Ordering::Relaxed);

        k.timer_init(&TMR, 2, 2, bump, core::ptr::null_mut(), true).unwrap();
        for _ in 0..4 {
            k.tick();
        }
        k.postproc_drain_jobs();
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert!(k.timer_query(&TMR).unwrap());

        for _ in 0..2 {
            k.tick();
        }
        k.postproc_drain_jobs();
        assert_eq!(HITS.load(Ordering::Relaxed), 2);
    }
}
