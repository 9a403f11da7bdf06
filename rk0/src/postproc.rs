//! C15: the post-processing system task and its deferred-job queue.
//!
//! Grounded on `original_source/core/src/ksystasks.c`'s `TimerHandlerTask`
//! and the `kPostProcJobEnq` calls in `kmesgq.c`/`ksleepq.c` (the function
//! itself is referenced but its body is not present in the source this
//! crate draws on, so the queue below is an original implementation of the
//! pattern those call sites describe: a fixed-capacity ring buffer an ISR
//! can push onto without doing the waiter's own unbounded work inline).
//!
//! The post-processing task is priority 0 — the highest in the system — and
//! non-preemptible by anything except itself and interrupts, so draining it
//! promptly never starves other work for long: there is nothing above it to
//! starve.
use rk0_port::Port;

use crate::kernel::Kernel;
use crate::sched::POSTPROC_PID;
use crate::task::{TaskIdx, TaskState};

/// Event-flag bit the post-processing task waits on for "a deferred job is
/// queued" (`spec.md` §4.15), alongside [`crate::tick::POSTPROC_SIG_TIMER`].
pub const POSTPROC_SIG_JOB: u32 = 0x2;

const CAPACITY: usize = 8;

#[derive(Clone, Copy)]
pub(crate) enum JobKind {
    /// A callout timer's delta-list node expired; run its callback and, if
    /// it reloads, reinsert it with its phase discarded.
    TimerDue,
    /// A sleep queue's `kSleepQueueWake` was called from an ISR; wake up to
    /// `arg` waiters.
    SleepQueueWake,
    /// A message queue's posting side needs its waiting readers reset from
    /// an ISR context (`kmesgq.c`'s `RK_POSTPROC_JOB_MESGQ_RESET`).
    MesgQueueReset,
}

#[derive(Clone, Copy)]
pub(crate) struct Job {
    pub kind: JobKind,
    /// Erased pointer to the owning object (`TimerCb<P>`, `SleepQueueCb<P>`,
    /// or `MesgQueueCb<...>`), cast back by whichever drain arm handles it —
    /// each arm knows its own concrete type from `kind`.
    pub target: *const (),
    pub arg: u32,
}

/// A small fixed-capacity ring buffer. Pushing past capacity drops the job
/// and the caller has nothing useful to do about it from ISR context — the
/// original has the same property (an unbounded `kPostProcJobEnq` would
/// defeat the purpose of deferring work out of the interrupt in the first
/// place), so this is documented as a known compromise rather than silently
/// "handled".
pub(crate) struct JobQueue {
    jobs: [Option<Job>; CAPACITY],
    head: u8,
    len: u8,
}

impl JobQueue {
    pub const fn new() -> Self {
        Self {
            jobs: [None; CAPACITY],
            head: 0,
            len: 0,
        }
    }

    /// Returns `false` if the queue was full and the job was dropped.
    fn push(&mut self, job: Job) -> bool {
        if self.len as usize == CAPACITY {
            return false;
        }
        let tail = (self.head as usize + self.len as usize) % CAPACITY;
        self.jobs[tail] = Some(job);
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<Job> {
        if self.len == 0 {
            return None;
        }
        let job = self.jobs[self.head as usize].take();
        self.head = ((self.head as usize + 1) % CAPACITY) as u8;
        self.len -= 1;
        job
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// Queue a job for the post-processing task to run outside interrupt
    /// context, and wake it if it is blocked waiting for one. Called from
    /// both task and ISR context; `spec.md` §4.15 requires this path never
    /// blocks or does unbounded work.
    pub(crate) fn postproc_enqueue(&mut self, kind: JobKind, target: *const (), arg: u32) -> bool {
        let signal = match kind {
            JobKind::TimerDue => crate::tick::POSTPROC_SIG_TIMER,
            JobKind::SleepQueueWake | JobKind::MesgQueueReset => POSTPROC_SIG_JOB,
        };
        let queued = self.jobs.push(Job { kind, target, arg });
        let postproc = TaskIdx(POSTPROC_PID);
        let tcb = self.task_mut(postproc);
        tcb.current_flags |= signal;
        let woken = tcb.status.is_blocked_on_object() && (tcb.required_flags & tcb.current_flags) != 0;
        if woken {
            self.task_mut(postproc).status = TaskState::Ready;
            self.make_ready_front(postproc);
        }
        queued
    }

    /// Drain every queued job, running each to completion. Called from the
    /// post-processing task's own loop, i.e. task context, never ISR
    /// context, so running a user callback here is safe.
    pub(crate) fn postproc_drain_jobs(&mut self) {
        while let Some(job) = self.jobs.pop() {
            match job.kind {
                #[cfg(feature = "callout_timer")]
                JobKind::TimerDue => {
                    // Safety: `target` was queued by `timer::mark_due` as
                    // the erased form of a live, `'static` `TimerCb<P>`.
                    unsafe { crate::timer::run_due::<P, NTASKS, NPRIO>(self, job.target) };
                }
                #[cfg(not(feature = "callout_timer"))]
                JobKind::TimerDue => {}
                #[cfg(feature = "sleep_queue")]
                JobKind::SleepQueueWake => {
                    // Safety: see `crate::sleepq::wake`'s ISR deferral path.
                    unsafe { crate::sleepq::run_deferred_wake::<P, NTASKS, NPRIO>(self, job.target, job.arg) };
                }
                #[cfg(not(feature = "sleep_queue"))]
                JobKind::SleepQueueWake => {}
                #[cfg(feature = "mesg_queue")]
                JobKind::MesgQueueReset => {
                    // Safety: see `crate::mesgq`'s ISR deferral path.
                    unsafe { crate::mesgq::run_deferred_reset::<P, NTASKS, NPRIO>(self, job.target, job.arg) };
                }
                #[cfg(not(feature = "mesg_queue"))]
                JobKind::MesgQueueReset => {}
            }
        }
    }
}

/// Post-processing task entry point. One priority above idle, created by
/// [`crate::sched::Kernel::init_system_tasks`]. Waits forever on
/// [`crate::tick::POSTPROC_SIG_TIMER`] or [`POSTPROC_SIG_JOB`], draining due
/// timers and deferred jobs each time it wakes.
///
/// # Safety
/// `kernel_ptr` must be `&KERNEL as *const _ as *mut ()` for the same
/// `Kernel<P, NTASKS, NPRIO>` instance the port's interrupt handlers drive,
/// and that instance must outlive the task (it does — it is `'static`).
pub unsafe extern "C" fn postproc_entry<P: Port, const NTASKS: usize, const NPRIO: usize>(kernel_ptr: *mut ()) {
    let kernel = unsafe { &mut *(kernel_ptr as *mut Kernel<P, NTASKS, NPRIO>) };
    loop {
        let signal_mask = crate::tick::POSTPROC_SIG_TIMER | POSTPROC_SIG_JOB;
        let _ = kernel.event_get(signal_mask, crate::task::FlagsWaitMode::Any, crate::time::WAIT_FOREVER);
        kernel.postproc_drain_jobs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_wraps_and_reports_full() {
        let mut q = JobQueue::new();
        for i in 0..CAPACITY as u32 {
            assert!(q.push(Job {
                kind: JobKind::TimerDue,
                target: core::ptr::null(),
                arg: i
            }));
        }
        assert!(!q.push(Job {
            kind: JobKind::TimerDue,
            target: core::ptr::null(),
            arg: 99
        }));
        for i in 0..CAPACITY as u32 {
            assert_eq!(q.pop().unwrap().arg, i);
        }
        assert!(q.pop().is_none());
    }
}
