//! C7: the tick handler, invoked from the port's `SysTick` (or equivalent)
//! interrupt. Grounded on `original_source/core/src/ksch.c`'s
//! `kTickHandler`: advance the global tick, age the delta-list head, and
//! either resume timed-out waiters directly (blocking/event-flag timeouts)
//! or hand off to the post-processing task (callout timers, `spec.md`
//! §4.15) since running a user callback is not safe from interrupt context.
use rk0_port::Port;

use crate::kernel::Kernel;
use crate::task::TaskState;
use crate::timeout::{DeltaList, Owner, TimeoutKind};

/// Event-flag bit the post-processing task waits on for "a callout timer
/// expired, run its due callbacks" (`spec.md` §4.15).
pub const POSTPROC_SIG_TIMER: u32 = 0x1;

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// Advance time by one tick. Returns `true` if the port should pend a
    /// context switch before returning from the interrupt.
    pub fn tick(&mut self) -> bool {
        self.tick = self.tick.wrapping_add(1);
        if self.tick == u32::MAX {
            self.tick = 0;
            self.n_wraps = self.n_wraps.wrapping_add(1);
        }

        // Taken out of `self` for the duration of the callback so the
        // closure can still borrow `self` mutably to reach the task pool.
        let mut delta: DeltaList = core::mem::take(&mut self.delta);
        // `spec.md` §4.2/§4.4: a task becoming ready only earns an
        // immediate switch if it outranks the running task and the running
        // task is preemptible. The running task itself can never appear in
        // this delta-list (a `Running` task is in no queue), so that
        // comparison — not "did the current task's own status change" — is
        // the only way this handler can discover a switch is owed.
        let mut need_switch = false;
        delta.advance_one_tick(|kind, owner| match (kind, owner) {
            (TimeoutKind::Call, Owner::Timer(timer)) => {
                // Safety: timers are `'static` and only ever reached
                // through a live delta-list node, which this callback is
                // processing as it is removed. Queues the callback for the
                // post-processing task rather than running it here —
                // running arbitrary user code from interrupt context is
                // not safe (`spec.md` §4.15).
                unsafe { crate::timer::mark_due::<P, NTASKS, NPRIO>(self, timer) };
            }
            (TimeoutKind::TimeEvent, Owner::Task(idx)) => {
                // `kSleep`/`kSleepUntil`: a plain wake, never an error —
                // the original leaves `timeOut` false for this kind.
                self.task_mut(idx).status = TaskState::Ready;
                self.make_ready(idx);
                if wakes_preempt(self, idx) {
                    need_switch = true;
                }
            }
            (_, Owner::Task(idx)) => {
                let tcb = self.task_mut(idx);
                tcb.timed_out = true;
                if tcb.status.is_blocked_on_object() {
                    if let Some(mtx) = tcb.waiting_for_mutex {
                        // Safety: the mutex outlives any task blocked on
                        // it, by construction (it is `'static`).
                        unsafe { crate::mutex::remove_waiter::<P, NTASKS>(mtx, &mut self.tasks, idx) };
                        self.task_mut(idx).waiting_for_mutex = None;
                    }
                    match self.task(idx).blocked_on {
                        crate::task::BlockedOn::None => {}
                        #[cfg(feature = "semaphore")]
                        crate::task::BlockedOn::Semaphore(sem) => {
                            // Safety: the semaphore outlives any task
                            // blocked on it, by construction (it is
                            // `'static`).
                            unsafe { crate::semaphore::remove_waiter::<P, NTASKS>(sem, &mut self.tasks, idx) };
                        }
                        #[cfg(feature = "sleep_queue")]
                        crate::task::BlockedOn::SleepQueue(sq) => {
                            // Safety: same argument as the semaphore arm.
                            unsafe { crate::sleepq::remove_waiter::<P, NTASKS>(sq, &mut self.tasks, idx) };
                        }
                        #[cfg(feature = "mesg_queue")]
                        crate::task::BlockedOn::MesgQueue(mq) => {
                            // Safety: same argument as the semaphore arm.
                            unsafe { crate::mesgq::remove_waiter::<P, NTASKS>(mq, &mut self.tasks, idx) };
                        }
                    }
                    self.task_mut(idx).blocked_on = crate::task::BlockedOn::None;
                }
                self.task_mut(idx).status = TaskState::Ready;
                self.make_ready(idx);
                if wakes_preempt(self, idx) {
                    need_switch = true;
                }
            }
            _ => {}
        });
        self.delta = delta;

        need_switch
    }
}

/// Would the task just readied at `idx` preempt whoever is currently
/// running, per `spec.md` §4.2's preemption-on-ready policy? (Strictly
/// higher priority, and the running task is preemptible; the scheduler-lock
/// case is handled by the generic `reschedule` path elsewhere — the tick
/// handler itself never locks the scheduler, so there is nothing to defer
/// here.)
fn wakes_preempt<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &Kernel<P, NTASKS, NPRIO>,
    idx: crate::task::TaskIdx,
) -> bool {
    let cur = kernel.current();
    kernel.task(cur).preemptible && kernel.task(idx).priority < kernel.task(cur).priority
}
