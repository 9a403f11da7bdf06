//! C6: the high-level scheduler — task creation, yield, priority queries,
//! and the scheduler-lock pair. Grounded on
//! `original_source/core/src/ksch.c`'s `kCreateTask`/`kInitTcb_`/`kYield`.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::klock;
use crate::task::{TaskIdx, TaskState};

/// Reserved pid for the idle task (`spec.md` §4.16), always created first.
pub const IDLE_PID: u8 = 0;
/// Reserved pid for the post-processing system task (`spec.md` §4.15),
/// always created second, one priority level above idle.
pub const POSTPROC_PID: u8 = 1;

pub type TaskEntry = unsafe extern "C" fn(*mut ());

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// Register the kernel's two system tasks. Must run once, before any
    /// `create_task` call and before [`Self::start`].
    pub fn init_system_tasks(
        &mut self,
        idle_entry: TaskEntry,
        idle_arg: *mut (),
        idle_stack: &'static mut [usize],
        postproc_entry: TaskEntry,
        postproc_arg: *mut (),
        postproc_stack: &'static mut [usize],
    ) -> Result<()> {
        if self.next_pid != 0 {
            return Err(self.raise(Error::ObjectDoubleInit));
        }
        let idle_prio = (NPRIO - 1) as u8;
        self.spawn(idle_entry, idle_arg, "IdlTask", idle_stack, idle_prio, true)?;
        // Post-processing task: priority 0, run-to-completion (`spec.md`
        // §4.12) so draining timers/jobs is never preempted by a user task.
        self.spawn(postproc_entry, postproc_arg, "SyTmrTsk", postproc_stack, 0, false)?;
        Ok(())
    }

    /// Create a user task. `spec.md` Non-goals: this may only be called
    /// during boot, before [`Self::start`] hands off to the dispatcher —
    /// there is no `kDeleteTask`/dynamic re-creation. `preemptible` is
    /// `spec.md` §3's per-task preempt flag: when `false`, the task only
    /// gives up the CPU by blocking or yielding, never by a higher-priority
    /// task becoming ready (`spec.md` §4.2).
    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        arg: *mut (),
        name: &'static str,
        stack: &'static mut [usize],
        priority: u8,
        preemptible: bool,
    ) -> Result<TaskIdx> {
        if priority as usize >= NPRIO {
            return Err(self.raise(Error::InvalidParam));
        }
        self.spawn(entry, arg, name, stack, priority, preemptible)
    }

    fn spawn(
        &mut self,
        entry: TaskEntry,
        arg: *mut (),
        name: &'static str,
        stack: &'static mut [usize],
        priority: u8,
        preemptible: bool,
    ) -> Result<TaskIdx> {
        let pid = self.next_pid;
        if pid as usize >= NTASKS {
            return Err(self.raise(Error::TaskCountMismatch));
        }
        let idx = TaskIdx(pid);

        stack[0] = rk0_port::STACK_GUARD_WORD;
        let stack_base = stack.as_mut_ptr();
        let stack_words = stack.len() as u32;
        // Safety: `stack` is `'static`, owned exclusively by this task for
        // its whole lifetime, and large enough for the port's exception
        // frame (checked by the port implementation).
        let sp = unsafe { P::init_task_stack(stack, entry, arg) };

        let tcb = self.task_mut(idx);
        *tcb = crate::task::TaskCb::dormant();
        tcb.sp = sp;
        tcb.stack_base = stack_base;
        tcb.stack_words = stack_words;
        tcb.name = name;
        tcb.pid = pid;
        tcb.priority = priority;
        tcb.base_priority = priority;
        tcb.preemptible = preemptible;
        tcb.status = TaskState::Ready;

        self.next_pid += 1;
        self.make_ready(idx);
        Ok(idx)
    }

    /// Hand control to the dispatcher. Diverges: the port's
    /// `start_first_task` loads the highest-priority ready task's context
    /// and never returns (`spec.md` §4.1/§6).
    pub fn start(&mut self) -> ! {
        let idx = self
            .highest_ready_for_start()
            .expect("rk0: no ready tasks at boot — call init_system_tasks/create_task first");
        self.remove_ready(idx);
        self.task_mut(idx).status = TaskState::Running;
        self.task_mut(idx).run_count += 1;
        self.current = Some(idx);
        P::start_first_task()
    }

    fn highest_ready_for_start(&self) -> Option<TaskIdx> {
        self.bitmap.highest::<P>().and_then(|prio| self.ready[prio as usize].front())
    }

    /// `kYield`: give up the remainder of the current time slice at the
    /// current priority, letting any other ready task at the same priority
    /// run, or resuming immediately if none exists.
    pub fn yield_now(&mut self) {
        let guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let cur = self.current();
        self.remove_ready_if_queued(cur);
        self.make_ready(cur);
        drop(guard);
        P::pend_context_switch();
    }

    fn remove_ready_if_queued(&mut self, _idx: TaskIdx) {
        // The running task is never on a ready queue by construction; this
        // hook exists so `yield_now` reads the same either way regardless
        // of that invariant, and to mirror the original's defensive
        // `kTCBQRem` call before `kTCBQEnq` in `kYield`.
    }

    pub fn sched_lock_depth(&self) -> u16 {
        self.sched_lock
    }
}
