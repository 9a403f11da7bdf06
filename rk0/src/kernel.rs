//! The kernel object: owns the task pool, the ready-queue table, the
//! presence bitmap and the timeout delta-list (`spec.md` §3, components
//! C1/C3/C4 as embedded in one struct rather than free-standing globals,
//! since Rust has no equivalent to the original's file-scope `RK_TCB
//! tcbs[RK_NTHREADS]` / `RK_gRunPtr` pair without `unsafe static mut`).
use rk0_port::Port;

use crate::bitmap::ReadyBitmap;
use crate::list::TaskQueue;
use crate::postproc::JobQueue;
use crate::task::{TaskCb, TaskIdx, TaskState};
use crate::timeout::DeltaList;

/// `Kernel<P, NTASKS, NPRIO>` is the single instance of kernel state a port
/// crate declares (typically as a `static mut`, handed to the port's
/// `PendSV`/`SysTick` handlers). `NTASKS` is the fixed task count (`spec.md`
/// Non-goals: no dynamic task creation after boot); `NPRIO` is the number of
/// priority levels, capped at 32 so [`ReadyBitmap`] stays a single word.
pub struct Kernel<P: Port, const NTASKS: usize, const NPRIO: usize> {
    pub(crate) tasks: [TaskCb; NTASKS],
    pub(crate) ready: [TaskQueue; NPRIO],
    pub(crate) bitmap: ReadyBitmap,
    pub(crate) delta: DeltaList,
    pub(crate) current: Option<TaskIdx>,
    pub(crate) tick: u32,
    pub(crate) n_wraps: u32,
    /// Nesting depth of `kSchedLock`/`kSchedUnlock` (`spec.md` §4.6):
    /// while nonzero, preemption decisions are deferred rather than acted
    /// on immediately.
    pub(crate) sched_lock: u16,
    pub(crate) pending_switch: bool,
    pub(crate) next_pid: u8,
    pub(crate) jobs: JobQueue,
    _port: core::marker::PhantomData<P>,
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    pub const fn new() -> Self {
        const { assert!(NPRIO <= 32, "rk0: at most 32 priority levels") };
        Self {
            tasks: [const { TaskCb::dormant() }; NTASKS],
            ready: [const { TaskQueue::new() }; NPRIO],
            bitmap: ReadyBitmap::new(),
            delta: DeltaList::new(),
            current: None,
            tick: 0,
            n_wraps: 0,
            sched_lock: 0,
            pending_switch: false,
            next_pid: 0,
            jobs: JobQueue::new(),
            _port: core::marker::PhantomData,
        }
    }

    pub fn current(&self) -> TaskIdx {
        self.current.expect("rk0: no task running yet")
    }

    /// Route a fault-band [`Error`](crate::error::Error) through the
    /// fault-trace sink (`spec.md` §4.14/§7) before handing it back to the
    /// caller. Every entry point that can return a programmer/system-fault
    /// error calls this at the point of return; transient "can't proceed
    /// now" errors bypass it entirely (`Error::is_fault` is `false` for
    /// those, so this is a no-op if one is ever passed in by mistake).
    pub(crate) fn raise(&self, err: crate::error::Error) -> crate::error::Error {
        if err.is_fault() {
            let (task_name, pid) = match self.current {
                Some(idx) => (self.tasks[idx.0 as usize].name, self.tasks[idx.0 as usize].pid),
                None => ("<none>", 0),
            };
            crate::fault::record(crate::fault::FaultRecord {
                task_name,
                pid,
                tick: self.tick,
                error: err,
            });
        }
        err
    }

    pub fn task(&self, idx: TaskIdx) -> &TaskCb {
        &self.tasks[idx.0 as usize]
    }

    pub fn task_mut(&mut self, idx: TaskIdx) -> &mut TaskCb {
        &mut self.tasks[idx.0 as usize]
    }

    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    /// Insert `idx` into its priority's ready queue, set its bitmap bit and
    /// mark it `Ready` (`spec.md` §4.6). Does not itself decide whether to
    /// preempt; callers follow up with [`Self::reschedule`].
    pub(crate) fn make_ready(&mut self, idx: TaskIdx) {
        let prio = self.tasks[idx.0 as usize].priority;
        self.tasks[idx.0 as usize].status = TaskState::Ready;
        self.ready[prio as usize].insert_by_priority(&mut self.tasks, idx);
        self.bitmap.set(prio);
    }

    /// As [`Self::make_ready`] but jams `idx` to the front of its ready
    /// queue — used to give the post-processing task (`spec.md` §4.15)
    /// priority over other tasks at the same level,
    /// `original_source/core/src/ksch.c`'s `kTCBQJam`.
    pub(crate) fn make_ready_front(&mut self, idx: TaskIdx) {
        let prio = self.tasks[idx.0 as usize].priority;
        self.tasks[idx.0 as usize].status = TaskState::Ready;
        self.ready[prio as usize].push_front(&mut self.tasks, idx);
        self.bitmap.set(prio);
    }

    pub(crate) fn remove_ready(&mut self, idx: TaskIdx) {
        let prio = self.tasks[idx.0 as usize].priority;
        self.ready[prio as usize].remove(&mut self.tasks, idx);
        if self.ready[prio as usize].is_empty() {
            self.bitmap.clear(prio);
        }
    }

    fn highest_ready(&self) -> Option<TaskIdx> {
        let prio = self.bitmap.highest::<P>()?;
        self.ready[prio as usize].front()
    }

    /// Core preemption decision (`original_source/core/src/ksch.c`'s
    /// `kSchedTask`): if the highest-priority ready task outranks whoever is
    /// running, either switch immediately or, if the scheduler is locked,
    /// remember that a switch is owed. A run-to-completion (non-preemptible)
    /// running task is never switched out by this path (`spec.md` §4.2) —
    /// it only yields voluntarily or by blocking.
    pub(crate) fn reschedule(&mut self) {
        let Some(next) = self.highest_ready() else {
            return;
        };
        let switch_needed = match self.current {
            None => true,
            Some(cur) => {
                self.tasks[cur.0 as usize].preemptible
                    && self.tasks[next.0 as usize].priority < self.tasks[cur.0 as usize].priority
            }
        };
        if !switch_needed {
            return;
        }
        if self.sched_lock > 0 {
            self.pending_switch = true;
        } else {
            P::pend_context_switch();
        }
    }

    /// Called by the port's `PendSV` handler (or equivalent) once it has
    /// saved the outgoing context: pick the next task to run, account for
    /// preemption, and report its stack pointer for the port to restore.
    pub fn switch_next(&mut self) -> *mut usize {
        if let Some(cur) = self.current {
            let cur_tcb = &mut self.tasks[cur.0 as usize];
            if cur_tcb.status == TaskState::Running {
                cur_tcb.status = TaskState::Ready;
                let prio = cur_tcb.priority;
                self.ready[prio as usize].insert_by_priority(&mut self.tasks, cur);
                self.bitmap.set(prio);
            }
        }
        let next = self
            .highest_ready()
            .expect("rk0: ready set must never be empty (idle task always runnable)");
        self.remove_ready(next);
        if let Some(cur) = self.current {
            if cur != next {
                self.tasks[next.0 as usize].n_preempted = 0;
                self.tasks[cur.0 as usize].preempted_by = Some(self.tasks[next.0 as usize].pid);
                self.tasks[cur.0 as usize].n_preempted += 1;
            }
        }
        self.tasks[next.0 as usize].status = TaskState::Running;
        self.tasks[next.0 as usize].run_count += 1;
        self.current = Some(next);
        self.pending_switch = false;
        self.tasks[next.0 as usize].sp_slot()
    }

    pub fn sched_lock(&mut self) {
        self.sched_lock += 1;
    }

    /// `kSchedUnlock`: drop the nesting depth, and if a switch was deferred
    /// while locked, act on it now.
    pub fn sched_unlock(&mut self) {
        debug_assert!(self.sched_lock > 0);
        self.sched_lock -= 1;
        if self.sched_lock == 0 && self.pending_switch {
            P::pend_context_switch();
        }
    }
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Default for Kernel<P, NTASKS, NPRIO> {
    fn default() -> Self {
        Self::new()
    }
}
