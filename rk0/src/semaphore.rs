//! C9: counting and binary semaphores.
//!
//! Grounded on `original_source/core/src/ksema.c`. A semaphore with
//! `max_value == 1` is binary: a successful pend always sets the value to
//! `0` rather than decrementing it, so a post racing a second post while a
//! pend is outstanding cannot push the value above `1`.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::klock::{self, CpuLockCell};
use crate::kernel::Kernel;
use crate::list::TaskQueue;
use crate::obj::ObjectKind;
use crate::task::TaskState;
use crate::time::{self, Tick, NO_WAIT, WAIT_FOREVER};
use crate::timeout::{Owner, TimeoutKind};

struct SemaphoreState {
    init: bool,
    kind: ObjectKind,
    value: u32,
    max_value: u32,
    waiting: TaskQueue,
}

/// A counting (or, with `max_value == 1`, binary) semaphore. Declared
/// `'static` by the application, e.g.
/// `static FREE_SLOTS: Semaphore<MyPort> = Semaphore::new(0, 4);`.
pub struct SemaphoreCb<P: Port> {
    inner: CpuLockCell<P, SemaphoreState>,
}

// Safety: all access to `inner` goes through `CpuLockCell`, which requires
// a live `CpuLockToken<P>`.
unsafe impl<P: Port> Sync for SemaphoreCb<P> {}

impl<P: Port> SemaphoreCb<P> {
    pub const fn new(initial: u32, max: u32) -> Self {
        Self {
            inner: CpuLockCell::new(SemaphoreState {
                init: false,
                kind: ObjectKind::Semaphore,
                value: initial,
                max_value: max,
                waiting: TaskQueue::new(),
            }),
        }
    }

    /// `0 < max`, `initial <= max`.
    pub fn init(&self) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        if st.init {
            return Err(Error::ObjectDoubleInit);
        }
        if st.max_value == 0 || st.value > st.max_value {
            return Err(Error::InvalidParam);
        }
        st.init = true;
        Ok(())
    }

    fn check_init(st: &SemaphoreState) -> Result<()> {
        if !st.init {
            return Err(Error::ObjectNotInit);
        }
        if st.kind != ObjectKind::Semaphore {
            return Err(Error::InvalidObject);
        }
        Ok(())
    }

    fn is_binary(st: &SemaphoreState) -> bool {
        st.max_value == 1
    }

    fn erased(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// # Safety
    /// `ptr` must have come from [`Self::erased`] on a live `SemaphoreCb<P>`
    /// with this same `P`.
    unsafe fn from_erased<'a>(ptr: *const ()) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    pub fn semaphore_pend(&mut self, sem: &'static SemaphoreCb<P>, timeout: Tick) -> Result<()> {
        if P::is_isr() && timeout != NO_WAIT {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        time::validate_timeout(timeout).map_err(|e| self.raise(e))?;

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = sem.inner.get_mut(&mut token);
            SemaphoreCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        }

        {
            let st = sem.inner.get_mut(&mut token);
            if st.value > 0 {
                if SemaphoreCb::<P>::is_binary(st) {
                    st.value = 0;
                } else {
                    st.value -= 1;
                }
                return Ok(());
            }
        }

        if timeout == NO_WAIT {
            return Err(Error::WouldBlock);
        }

        let cur = self.current();
        {
            let st = sem.inner.get_mut(&mut token);
            st.waiting.insert_by_priority(&mut self.tasks, cur);
        }
        self.task_mut(cur).status = TaskState::Blocked;
        self.task_mut(cur).blocked_on = crate::task::BlockedOn::Semaphore(sem.erased());

        if timeout != WAIT_FOREVER {
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
            // Safety: `cur`'s `timeout_node` outlives the wait, it is part
            // of the task pool for the process lifetime.
            unsafe {
                self.delta.insert(node, TimeoutKind::Blocking, Owner::Task(cur), timeout);
            }
        }

        drop(token);
        drop(guard);

        P::pend_context_switch();

        let guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        drop(guard);

        self.task_mut(cur).blocked_on = crate::task::BlockedOn::None;
        if self.task(cur).timed_out {
            self.task_mut(cur).timed_out = false;
            return Err(Error::Timeout);
        }
        Ok(())
    }

    pub fn semaphore_post(&mut self, sem: &'static SemaphoreCb<P>) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = sem.inner.get_mut(&mut token);
            SemaphoreCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        }

        let waiting_front = sem.inner.get_mut(&mut token).waiting.front();
        if let Some(next) = waiting_front {
            {
                let st = sem.inner.get_mut(&mut token);
                st.waiting.remove(&mut self.tasks, next);
            }
            if self.task(next).timeout_node.is_linked() {
                let node = &mut self.tasks[next.0 as usize].timeout_node as *mut _;
                unsafe { self.delta.remove(node) };
            }
            drop(token);
            drop(guard);
            self.make_ready(next);
            self.reschedule();
            return Ok(());
        }

        let st = sem.inner.get_mut(&mut token);
        if SemaphoreCb::<P>::is_binary(st) {
            if st.value != 0 {
                Err(Error::QueueFull)
            } else {
                st.value = 1;
                Ok(())
            }
        } else if st.value == st.max_value {
            Err(Error::QueueFull)
        } else {
            st.value += 1;
            Ok(())
        }
    }

    /// Wake every waiter at once, with the scheduler locked so no
    /// intermediate preemption can occur mid-drain; the highest-priority
    /// woken task is picked for the final reschedule, matching
    /// `kSemaphoreFlush`. `Error::EmptyWaitingQueue` if nobody was blocked.
    pub fn semaphore_flush(&mut self, sem: &'static SemaphoreCb<P>) -> Result<()> {
        if P::is_isr() {
            return Err(self.raise(Error::InvalidIsrUse));
        }

        {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let st = sem.inner.get_mut(&mut token);
            SemaphoreCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        }

        let to_wake = {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            sem.inner.get_mut(&mut token).waiting.len()
        };
        if to_wake == 0 {
            return Err(Error::EmptyWaitingQueue);
        }

        self.sched_lock();

        let mut chosen = None;
        for _ in 0..to_wake {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let Some(next) = sem.inner.get_mut(&mut token).waiting.front() else {
                break;
            };
            sem.inner.get_mut(&mut token).waiting.remove(&mut self.tasks, next);
            if self.task(next).timeout_node.is_linked() {
                let node = &mut self.tasks[next.0 as usize].timeout_node as *mut _;
                unsafe { self.delta.remove(node) };
            }
            drop(token);
            drop(guard);
            self.make_ready(next);
            chosen = match chosen {
                None => Some(next),
                Some(c) if self.task(next).priority < self.task(c).priority => Some(next),
                some_c => some_c,
            };
        }

        {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            sem.inner.get_mut(&mut token).value = 0;
        }
        if chosen.is_some() {
            self.reschedule();
        }

        self.sched_unlock();
        Ok(())
    }

    /// Current value, or the negated waiter count when waiters are present.
    pub fn semaphore_query(&mut self, sem: &'static SemaphoreCb<P>) -> Result<i32> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = sem.inner.get_mut(&mut token);
        SemaphoreCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        if st.waiting.len() > 0 {
            Ok(-(st.waiting.len() as i32))
        } else {
            Ok(st.value as i32)
        }
    }
}

/// Unlink a timed-out task from `sem_ptr`'s waiting queue. Called only from
/// the tick handler's timeout path, under the kernel lock.
///
/// # Safety
/// `sem_ptr` must be the erased form of a live, initialized `SemaphoreCb<P>`,
/// and `idx` must currently be linked in its waiting queue.
pub(crate) unsafe fn remove_waiter<P: Port, const NTASKS: usize>(
    sem_ptr: *const (),
    tasks: &mut [crate::task::TaskCb; NTASKS],
    idx: crate::task::TaskIdx,
) {
    // Safety: forwarded from caller's precondition.
    let sem = unsafe { SemaphoreCb::<P>::from_erased(sem_ptr) };
    let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
    let mut token = guard.borrow_mut();
    let st = sem.inner.get_mut(&mut token);
    st.waiting.remove(tasks, idx);
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
    fn binary_semaphore_pend_clamps_to_zero() {
        static SEM: SemaphoreCb<HostPort> = SemaphoreCb::new(1, 1);
        SEM.init().unwrap();
        let mut k: Kernel<HostPort, 2, 4> = Kernel::new();
        let mut idle_stack = [0usize; 64];
        let mut postproc_stack = [0usize; 64];
        k.init_system_tasks(
            noop_entry,
            core::ptr::null_mut(),
            unsafe { extend(&mut idle_stack) },
            noop_entry,
            core::ptr::null_mut(),
            unsafe { extend(&mut postproc_stack) },
        )
        .unwrap();
        k.current = Some(crate::task::TaskIdx(crate::sched::IDLE_PID));
        k.task_mut(crate::task::TaskIdx(crate::sched::IDLE_PID)).status = TaskState::Running;

        assert!(k.semaphore_pend(&SEM, NO_WAIT).is_ok());
        assert_eq!(k.semaphore_query(&SEM).unwrap(), 0);
        assert_eq!(k.semaphore_pend(&SEM, NO_WAIT), Err(Error::WouldBlock));
    }

    unsafe extern "C" fn noop_entry(_: *mut ()) {}

    unsafe fn extend<'a>(s: &'a mut [usize]) -> &'static mut [usize] {
        core::mem::transmute(s)
    }
}
