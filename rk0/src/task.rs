//! The task control block (`spec.md` §3 TCB, §4.3).
use crate::list::Link;
use crate::timeout::TimeoutNode;

/// Index of a task within the kernel's fixed `[TaskCb; NTASKS]` pool.
/// Tasks are never created after boot (`spec.md` Non-goals), so this index
/// is stable for the process lifetime — it plays the role the original's
/// `RK_PID` and the doubly-linked `tcbNode`/`timeoutNode` pointers play
/// together, collapsed into one small integer per `spec.md` §9's suggestion
/// to use index-into-pool linking where raw self-referential pointers would
/// otherwise be needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskIdx(pub u8);

/// Run state of a task, mirroring `original_source/core/inc/kcommondefs.h`'s
/// `RK_TASK_STATUS` bit values (kept as a closed Rust enum rather than a
/// bitfield since no caller needs to test a status bit directly — every
/// check is an equality or an `is_*` helper).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Slot not in use.
    Dormant,
    /// On a ready queue, eligible to run.
    Ready,
    /// Currently executing.
    Running,
    /// Blocked on a semaphore/mutex/event-flag-group/message queue.
    Blocked,
    /// Blocked specifically sending into a full queue.
    Sending,
    /// Blocked specifically receiving from an empty queue.
    Receiving,
    /// `kSleep`: fixed delay.
    SleepDelay,
    /// `kSleepUntil`: periodic release point.
    SleepUntil,
    /// On a sleep queue via `CondWait`/`Suspend`.
    SleepSuspended,
}

impl TaskState {
    pub const fn is_sleeping(self) -> bool {
        matches!(
            self,
            TaskState::SleepDelay | TaskState::SleepUntil | TaskState::SleepSuspended
        )
    }

    pub const fn is_blocked_on_object(self) -> bool {
        matches!(
            self,
            TaskState::Blocked | TaskState::Sending | TaskState::Receiving
        )
    }
}

/// Task event-flags wait mode (`spec.md` §4.11).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsWaitMode {
    Any,
    All,
}

/// Which object's waiting queue a blocked task sits on, if any other than a
/// mutex (mutexes keep their own `waiting_for_mutex` field since priority
/// inheritance needs it regardless of timeout). Used only by the tick
/// handler to unlink a task from the right queue on timeout expiry — the
/// pointee type is erased the same way `owned_mutexes` is, since `TaskCb` is
/// shared across every port instantiation.
#[derive(Clone, Copy)]
pub enum BlockedOn {
    None,
    #[cfg(feature = "semaphore")]
    Semaphore(*const ()),
    #[cfg(feature = "sleep_queue")]
    SleepQueue(*const ()),
    #[cfg(feature = "mesg_queue")]
    MesgQueue(*const ()),
}

pub struct TaskCb {
    /// Saved stack pointer while not running; valid only when `status !=
    /// Running`. Restored into the CPU's SP by the port on context switch
    /// (`original_source/core/inc/kobjs.h`'s `sp` field, "don't change" —
    /// it must stay the first thing the port's asm touches).
    pub sp: *mut usize,
    pub stack_base: *mut usize,
    pub stack_words: u32,
    pub name: &'static str,
    pub pid: u8,
    pub status: TaskState,
    pub priority: u8,
    /// Nominal priority the task was created with; `priority` may be
    /// temporarily boosted above this by mutex priority inheritance
    /// (`spec.md` §4.10, `original_source/core/src/kmutex.c`).
    pub base_priority: u8,
    /// `spec.md` §3/§4.2: preemptible vs run-to-completion. A task created
    /// with `preemptible == false` only gives up the CPU when it blocks or
    /// yields; a higher-priority task becoming ready does not pend a
    /// switch against it. The post-processing task is always created with
    /// this clear (`spec.md` §4.12).
    pub preemptible: bool,
    pub run_count: u32,
    pub n_preempted: u32,
    pub preempted_by: Option<u8>,

    pub required_flags: u32,
    pub current_flags: u32,
    pub flags_wait_mode: FlagsWaitMode,

    /// Ticks remaining for `kSleepPeriodic`-style accounting, or the
    /// absolute wake tick for `kSleepUntil`.
    pub last_wake_time: u32,

    /// Set by the timeout delta-list when a wait expired rather than being
    /// satisfied by a post/signal; consumed and cleared by the caller after
    /// resuming.
    pub timed_out: bool,

    /// Linkage used while this task sits on a ready queue or an object's
    /// waiting queue. Exactly one of these is active at a time.
    pub queue_link: Link,
    pub timeout_node: TimeoutNode,

    /// Head of the singly-linked list of mutexes currently owned by this
    /// task (`original_source/core/src/kmutex.c`'s `ownedMutexList`), used
    /// to walk the priority-inheritance chain. Opaque (`*const ()`) because
    /// `TaskCb` is shared by every port instantiation while `MutexCb<P>` is
    /// generic over the port; `crate::mutex` casts it back knowing its own
    /// `P` from context.
    pub owned_mutexes: Option<*const ()>,
    /// Mutex this task is currently blocked trying to lock, if any —
    /// `original_source/core/src/kmutex.c`'s `waitingForMutexPtr`.
    pub waiting_for_mutex: Option<*const ()>,
    /// Non-mutex object (semaphore/sleep queue/message queue) this task is
    /// currently linked into the waiting queue of, if any. See [`BlockedOn`].
    pub blocked_on: BlockedOn,
}

// Safety: task pool entries are only ever touched from within the kernel's
// critical section (single core, interrupts masked); the raw pointers above
// never escape that discipline.
unsafe impl Send for TaskCb {}

impl TaskCb {
    pub const fn dormant() -> Self {
        Self {
            sp: core::ptr::null_mut(),
            stack_base: core::ptr::null_mut(),
            stack_words: 0,
            name: "",
            pid: 0,
            status: TaskState::Dormant,
            priority: 0,
            base_priority: 0,
            preemptible: true,
            run_count: 0,
            n_preempted: 0,
            preempted_by: None,
            required_flags: 0,
            current_flags: 0,
            flags_wait_mode: FlagsWaitMode::Any,
            last_wake_time: 0,
            timed_out: false,
            queue_link: Link {
                prev: None,
                next: None,
            },
            timeout_node: TimeoutNode::new(),
            owned_mutexes: None,
            waiting_for_mutex: None,
            blocked_on: BlockedOn::None,
        }
    }

    pub fn is_ready_or_running(&self) -> bool {
        matches!(self.status, TaskState::Ready | TaskState::Running)
    }

    /// The stack pointer value the port should load when dispatching this
    /// task next.
    pub fn sp_slot(&self) -> *mut usize {
        self.sp
    }

    /// Check whether the guard word at the bottom of this task's stack
    /// survived (`spec.md` §4.3 stack-overflow detection), mirroring the
    /// original's canary check performed around context switches.
    pub fn stack_ok(&self) -> bool {
        if self.stack_base.is_null() {
            return true;
        }
        // Safety: `stack_base` points to `stack_words` words of memory this
        // task owns for its entire lifetime; word 0 holds the guard planted
        // at creation time and is never legitimately written by the task
        // (the stack grows down from the top).
        unsafe { self.stack_base.read() == rk0_port::STACK_GUARD_WORD }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeping_classification() {
        assert!(TaskState::SleepDelay.is_sleeping());
        assert!(TaskState::SleepUntil.is_sleeping());
        assert!(TaskState::SleepSuspended.is_sleeping());
        assert!(!TaskState::Blocked.is_sleeping());
        assert!(!TaskState::Ready.is_sleeping());
    }

    #[test]
    fn blocked_on_object_classification() {
        assert!(TaskState::Blocked.is_blocked_on_object());
        assert!(TaskState::Sending.is_blocked_on_object());
        assert!(TaskState::Receiving.is_blocked_on_object());
        assert!(!TaskState::SleepDelay.is_blocked_on_object());
    }
}
