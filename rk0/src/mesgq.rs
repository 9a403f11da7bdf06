//! C12: the unified message queue family — mailbox, mail queue, stream
//! queue, and message port all share one ring-buffer implementation.
//!
//! Grounded on `original_source/core/src/kmesgq.c`. A plain message queue and
//! a stream queue are the same [`MesgQueueCb`] at different `msg_words`; a
//! mailbox is the `msg_words == 1`, `n_mesg == 1` case, created through
//! [`MesgQueueCb::init_mailbox`] instead of [`MesgQueueCb::init`] so it picks
//! up the distinct [`ObjectKind::Mailbox`] tag `kMesgQueuePostOvw` requires —
//! mirroring `kMailboxInit` stamping `RK_MAILBOX_KOBJ_ID` over the same
//! layout `kMesgQueueInit` produces. The message port / RPC extension
//! (`original_source/core/src/kmesgport.c`, `spec.md` §4.10) is the same
//! queue again, with a server task attached, gated behind the `ports`
//! feature.
//!
//! Unlike the original's in-place `ULONG *writePtr`/`readPtr` threaded
//! straight through a caller-supplied buffer, this crate indexes the buffer
//! by message slot (`write_idx`/`read_idx` count messages, not words) —
//! equivalent FIFO-with-wraparound behavior, easier to keep memory-safe
//! since every offset is bounds-checked against `max_mesg` rather than
//! compared to a raw `bufEndPtr`.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::kernel::Kernel;
use crate::list::TaskQueue;
use crate::obj::ObjectKind;
use crate::postproc::JobKind;
use crate::task::{TaskIdx, TaskState};
use crate::time::{self, Tick, NO_WAIT, WAIT_FOREVER};
use crate::timeout::{Owner, TimeoutKind};

/// Minimum message size (in words) a [`MesgQueueCb`] used as a message port
/// must carry: one word for the sender's handle, one for the reply mailbox
/// pointer (`original_source/core/src/kmesgport.c`'s `RK_PORT_MSG_META`).
#[cfg(feature = "ports")]
pub const PORT_META_WORDS: usize = 2;

struct MesgQueueState {
    init: bool,
    kind: ObjectKind,
    /// Base of the externally-supplied backing buffer, `max_mesg * msg_words`
    /// words. Null until `init`.
    buf: *mut u32,
    msg_words: usize,
    max_mesg: usize,
    mesg_cnt: usize,
    write_idx: usize,
    read_idx: usize,
    owner: Option<TaskIdx>,
    waiting: TaskQueue,
    #[cfg(feature = "mesgq_notify")]
    notify: Option<fn(*const ())>,
    #[cfg(feature = "ports")]
    is_server: bool,
}

/// A message queue/mailbox/stream/port. Declared `'static` by the
/// application together with its backing buffer, e.g.
/// `static mut BUF: [u32; 4] = [0; 4];`
/// `static MBOX: MesgQueueCb<MyPort> = MesgQueueCb::new();`.
pub struct MesgQueueCb<P: Port> {
    inner: CpuLockCell<P, MesgQueueState>,
}

// Safety: all access to `inner` goes through `CpuLockCell`, which requires a
// live `CpuLockToken<P>`. The raw `buf` pointer is never read or written
// outside that section.
unsafe impl<P: Port> Sync for MesgQueueCb<P> {}

impl<P: Port> MesgQueueCb<P> {
    pub const fn new() -> Self {
        Self {
            inner: CpuLockCell::new(MesgQueueState {
                init: false,
                kind: ObjectKind::MesgQueue,
                buf: core::ptr::null_mut(),
                msg_words: 0,
                max_mesg: 0,
                mesg_cnt: 0,
                write_idx: 0,
                read_idx: 0,
                owner: None,
                waiting: TaskQueue::new(),
                #[cfg(feature = "mesgq_notify")]
                notify: None,
                #[cfg(feature = "ports")]
                is_server: false,
            }),
        }
    }

    fn init_impl(&self, buf: &'static mut [u32], msg_words: usize, n_mesg: usize, kind: ObjectKind) -> Result<()> {
        // message size needs to be 1, 2, or a multiple of 4 words, capped at 8.
        if msg_words == 0 || msg_words > 8 {
            return Err(Error::InvalidParam);
        }
        if msg_words != 1 && msg_words != 2 && msg_words % 4 != 0 {
            return Err(Error::InvalidParam);
        }
        if n_mesg == 0 {
            return Err(Error::InvalidParam);
        }
        if buf.len() != msg_words * n_mesg {
            return Err(Error::InvalidParam);
        }

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        if st.init {
            return Err(Error::ObjectDoubleInit);
        }
        st.buf = buf.as_mut_ptr();
        st.msg_words = msg_words;
        st.max_mesg = n_mesg;
        st.mesg_cnt = 0;
        st.write_idx = 0;
        st.read_idx = 0;
        st.owner = None;
        st.kind = kind;
        #[cfg(feature = "ports")]
        {
            st.is_server = false;
        }
        st.init = true;
        Ok(())
    }

    /// `kMesgQueueInit`: a plain message queue, mail queue, or stream queue —
    /// any capacity/width combination.
    pub fn init(&self, buf: &'static mut [u32], msg_words: usize, n_mesg: usize) -> Result<()> {
        self.init_impl(buf, msg_words, n_mesg, ObjectKind::MesgQueue)
    }

    /// `kMailboxInit`: the single-slot, single-word case, stamped with the
    /// object kind [`Kernel::mesgq_post_ovw`] requires.
    pub fn init_mailbox(&self, buf: &'static mut [u32; 1]) -> Result<()> {
        self.init_impl(&mut buf[..], 1, 1, ObjectKind::Mailbox)
    }

    fn check_init(st: &MesgQueueState) -> Result<()> {
        if !st.init {
            return Err(Error::ObjectNotInit);
        }
        if !matches!(st.kind, ObjectKind::MesgQueue | ObjectKind::Mailbox) {
            return Err(Error::InvalidObject);
        }
        Ok(())
    }

    fn erased(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// # Safety
    /// `ptr` must have come from [`Self::erased`] on a live `MesgQueueCb<P>`
    /// with this same `P`.
    unsafe fn from_erased<'a>(ptr: *const ()) -> &'a Self {
        unsafe { &*(ptr as *const Self) }
    }
}

impl<P: Port> Default for MesgQueueCb<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn write_message(st: &mut MesgQueueState, msg: &[u32]) {
    // Safety: `write_idx < max_mesg` and `msg.len() == msg_words` is checked
    // by every caller before reaching here, so the slot lies within `buf`'s
    // `max_mesg * msg_words` words.
    let slot = unsafe { st.buf.add(st.write_idx * st.msg_words) };
    for (i, word) in msg.iter().enumerate() {
        unsafe { slot.add(i).write(*word) };
    }
    st.write_idx = (st.write_idx + 1) % st.max_mesg;
    st.mesg_cnt += 1;
}

fn jam_message(st: &mut MesgQueueState, msg: &[u32]) {
    st.read_idx = (st.read_idx + st.max_mesg - 1) % st.max_mesg;
    // Safety: see `write_message`.
    let slot = unsafe { st.buf.add(st.read_idx * st.msg_words) };
    for (i, word) in msg.iter().enumerate() {
        unsafe { slot.add(i).write(*word) };
    }
    st.mesg_cnt += 1;
}

fn read_message(st: &mut MesgQueueState, out: &mut [u32]) {
    // Safety: see `write_message`.
    let slot = unsafe { st.buf.add(st.read_idx * st.msg_words) };
    for (i, word) in out.iter_mut().enumerate() {
        *word = unsafe { slot.add(i).read() };
    }
    st.read_idx = (st.read_idx + 1) % st.max_mesg;
    st.mesg_cnt -= 1;
}

fn peek_message(st: &MesgQueueState, out: &mut [u32]) {
    // Safety: see `write_message`.
    let slot = unsafe { st.buf.add(st.read_idx * st.msg_words) };
    for (i, word) in out.iter_mut().enumerate() {
        *word = unsafe { slot.add(i).read() };
    }
}

/// `kMesgQueueSend`'s owner boost: bump the queue's owner to
/// `min(its current priority, caller_base_prio)` — never a chain walk like
/// mutex priority inheritance, just a one-shot nudge so the consumer that
/// will eventually drain this queue gets a chance to run sooner.
fn boost_owner_priority<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    token: &mut CpuLockTokenRefMut<'_, P>,
    mq: &'static MesgQueueCb<P>,
    caller_base_prio: u8,
) {
    let Some(owner) = mq.inner.get_mut(token).owner else {
        return;
    };
    let mut target = kernel.task(owner).priority;
    if target > caller_base_prio {
        target = caller_base_prio;
    }
    if target == kernel.task(owner).priority {
        return;
    }
    if kernel.task(owner).status == TaskState::Ready {
        kernel.remove_ready(owner);
        kernel.task_mut(owner).priority = target;
        kernel.make_ready(owner);
    } else {
        kernel.task_mut(owner).priority = target;
    }
}

/// Undo [`boost_owner_priority`]: once the blocked sender wakes (`spec.md`
/// §4.10: "...restore on the caller's wake"), drop the owner back to its
/// own nominal priority.
fn restore_owner_priority<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    mq: &'static MesgQueueCb<P>,
) {
    let owner = {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        mq.inner.get_mut(&mut token).owner
    };
    let Some(owner) = owner else {
        return;
    };
    let nominal = kernel.task(owner).base_priority;
    if kernel.task(owner).priority == nominal {
        return;
    }
    if kernel.task(owner).status == TaskState::Ready {
        kernel.remove_ready(owner);
        kernel.task_mut(owner).priority = nominal;
        kernel.make_ready(owner);
    } else {
        kernel.task_mut(owner).priority = nominal;
    }
}

/// Wake the waiting queue's front task if it is blocked in the direction
/// `want` (a queue's waiting list can hold senders or receivers depending on
/// which side is currently stalled, but never a useful mix of both, so a
/// peek-then-check suffices — `kTCBQPeek` + status check in the original).
fn wake_front_if<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    mq: &'static MesgQueueCb<P>,
    want: TaskState,
) {
    let front = {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        mq.inner.get_mut(&mut token).waiting.front()
    };
    let Some(front) = front else {
        return;
    };
    if kernel.task(front).status != want {
        return;
    }
    {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        mq.inner.get_mut(&mut token).waiting.remove(&mut kernel.tasks, front);
    }
    if kernel.task(front).timeout_node.is_linked() {
        let node = &mut kernel.tasks[front.0 as usize].timeout_node as *mut _;
        // Safety: just confirmed `is_linked`.
        unsafe { kernel.delta.remove(node) };
    }
    kernel.task_mut(front).blocked_on = crate::task::BlockedOn::None;
    kernel.make_ready(front);
    kernel.reschedule();
}

impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// `kMesgQueueSetOwner`: attach a consuming task. `Error::MesgQueueHasOwner`
    /// if one is already attached — owners are not reassigned once set except
    /// through [`Self::mesgq_reset`].
    pub fn mesgq_set_owner(&mut self, mq: &'static MesgQueueCb<P>, owner: TaskIdx) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = mq.inner.get_mut(&mut token);
        MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        if st.owner.is_some() {
            return Err(self.raise(Error::MesgQueueHasOwner));
        }
        st.owner = Some(owner);
        Ok(())
    }

    #[cfg(feature = "mesgq_notify")]
    pub fn mesgq_install_send_notify(&mut self, mq: &'static MesgQueueCb<P>, cbk: fn(*const ())) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = mq.inner.get_mut(&mut token);
        MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        st.notify = Some(cbk);
        Ok(())
    }

    /// `kMesgQueueSend`: block while the queue is full, boosting the owner's
    /// priority if one is attached. `msg.len()` must equal the queue's
    /// configured `msg_words`.
    pub fn mesgq_send(&mut self, mq: &'static MesgQueueCb<P>, msg: &[u32], timeout: Tick) -> Result<()> {
        if P::is_isr() && timeout != NO_WAIT {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        time::validate_timeout(timeout).map_err(|e| self.raise(e))?;

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = mq.inner.get_mut(&mut token);
            MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
            if msg.len() != st.msg_words {
                return Err(self.raise(Error::InvalidParam));
            }
        }

        let cur = self.current();
        let full = {
            let st = mq.inner.get_mut(&mut token);
            st.mesg_cnt >= st.max_mesg
        };

        if !full {
            {
                let st = mq.inner.get_mut(&mut token);
                write_message(st, msg);
                #[cfg(feature = "mesgq_notify")]
                if let Some(cbk) = st.notify {
                    cbk(mq.erased());
                }
            }
            drop(token);
            drop(guard);
            wake_front_if(self, mq, TaskState::Receiving);
            return Ok(());
        }

        if timeout == NO_WAIT {
            return Err(Error::QueueFull);
        }

        {
            let st = mq.inner.get_mut(&mut token);
            st.waiting.insert_by_priority(&mut self.tasks, cur);
        }
        let caller_base = self.task(cur).base_priority;
        boost_owner_priority(self, &mut token, mq, caller_base);

        self.task_mut(cur).status = TaskState::Sending;
        self.task_mut(cur).blocked_on = crate::task::BlockedOn::MesgQueue(mq.erased());

        if timeout != WAIT_FOREVER {
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
            // Safety: `cur`'s `timeout_node` outlives the wait.
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
        restore_owner_priority(self, mq);
        if self.task(cur).timed_out {
            self.task_mut(cur).timed_out = false;
            return Err(Error::Timeout);
        }

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = mq.inner.get_mut(&mut token);
            write_message(st, msg);
            #[cfg(feature = "mesgq_notify")]
            if let Some(cbk) = st.notify {
                cbk(mq.erased());
            }
        }
        drop(token);
        drop(guard);
        wake_front_if(self, mq, TaskState::Receiving);
        Ok(())
    }

    /// `kMesgQueueJam`: like [`Self::mesgq_send`] but the message is pushed
    /// to the front of the queue, to be the very next one read.
    pub fn mesgq_jam(&mut self, mq: &'static MesgQueueCb<P>, msg: &[u32], timeout: Tick) -> Result<()> {
        if P::is_isr() && timeout != NO_WAIT {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        time::validate_timeout(timeout).map_err(|e| self.raise(e))?;

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = mq.inner.get_mut(&mut token);
            MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
            if msg.len() != st.msg_words {
                return Err(self.raise(Error::InvalidParam));
            }
        }

        let cur = self.current();
        let full = {
            let st = mq.inner.get_mut(&mut token);
            st.mesg_cnt >= st.max_mesg
        };

        if !full {
            {
                let st = mq.inner.get_mut(&mut token);
                jam_message(st, msg);
                #[cfg(feature = "mesgq_notify")]
                if let Some(cbk) = st.notify {
                    cbk(mq.erased());
                }
            }
            drop(token);
            drop(guard);
            wake_front_if(self, mq, TaskState::Receiving);
            return Ok(());
        }

        if timeout == NO_WAIT {
            return Err(Error::QueueFull);
        }

        {
            let st = mq.inner.get_mut(&mut token);
            st.waiting.insert_by_priority(&mut self.tasks, cur);
        }

        self.task_mut(cur).status = TaskState::Sending;
        self.task_mut(cur).blocked_on = crate::task::BlockedOn::MesgQueue(mq.erased());

        if timeout != WAIT_FOREVER {
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
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

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = mq.inner.get_mut(&mut token);
            jam_message(st, msg);
            #[cfg(feature = "mesgq_notify")]
            if let Some(cbk) = st.notify {
                cbk(mq.erased());
            }
        }
        drop(token);
        drop(guard);
        wake_front_if(self, mq, TaskState::Receiving);
        Ok(())
    }

    /// `kMesgQueueRecv`: rejected with `Error::MesgQueueNotOwner` if an owner
    /// is attached and it is not the calling task.
    pub fn mesgq_recv(&mut self, mq: &'static MesgQueueCb<P>, out: &mut [u32], timeout: Tick) -> Result<()> {
        if P::is_isr() && timeout != NO_WAIT {
            return Err(self.raise(Error::InvalidIsrUse));
        }
        time::validate_timeout(timeout).map_err(|e| self.raise(e))?;

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let cur = self.current();
        {
            let st = mq.inner.get_mut(&mut token);
            MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
            if out.len() != st.msg_words {
                return Err(self.raise(Error::InvalidParam));
            }
            if let Some(owner) = st.owner {
                if owner != cur {
                    return Err(self.raise(Error::MesgQueueNotOwner));
                }
            }
        }

        let empty = {
            let st = mq.inner.get_mut(&mut token);
            st.mesg_cnt == 0
        };

        if !empty {
            {
                let st = mq.inner.get_mut(&mut token);
                read_message(st, out);
            }
            drop(token);
            drop(guard);
            wake_front_if(self, mq, TaskState::Sending);
            return Ok(());
        }

        if timeout == NO_WAIT {
            return Err(Error::QueueEmpty);
        }

        {
            let st = mq.inner.get_mut(&mut token);
            st.waiting.insert_by_priority(&mut self.tasks, cur);
        }
        self.task_mut(cur).status = TaskState::Receiving;
        self.task_mut(cur).blocked_on = crate::task::BlockedOn::MesgQueue(mq.erased());

        if timeout != WAIT_FOREVER {
            let node = &mut self.tasks[cur.0 as usize].timeout_node as *mut _;
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

        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        {
            let st = mq.inner.get_mut(&mut token);
            read_message(st, out);
        }
        drop(token);
        drop(guard);
        wake_front_if(self, mq, TaskState::Sending);
        Ok(())
    }

    /// `kMesgQueuePeek`: copy the head message without consuming it.
    pub fn mesgq_peek(&mut self, mq: &'static MesgQueueCb<P>, out: &mut [u32]) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = mq.inner.get_mut(&mut token);
        MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        if out.len() != st.msg_words {
            return Err(self.raise(Error::InvalidParam));
        }
        if st.mesg_cnt == 0 {
            return Err(Error::QueueEmpty);
        }
        peek_message(st, out);
        Ok(())
    }

    pub fn mesgq_query(&mut self, mq: &'static MesgQueueCb<P>) -> Result<usize> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = mq.inner.get_mut(&mut token);
        MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        Ok(st.mesg_cnt)
    }

    /// `kMesgQueuePostOvw`: mailbox-only overwrite-post. Always succeeds
    /// (never blocks, never reports full); wakes a waiting reader only if the
    /// mailbox was empty before the overwrite, mirroring the original's
    /// comment that on a non-empty mailbox any existing waiters can only be
    /// readers still blocked on the *previous* post.
    pub fn mesgq_post_ovw(&mut self, mq: &'static MesgQueueCb<P>, msg: &[u32]) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = mq.inner.get_mut(&mut token);
        if !st.init {
            return Err(self.raise(Error::ObjectNotInit));
        }
        if st.kind != ObjectKind::Mailbox {
            return Err(self.raise(Error::InvalidObject));
        }
        if msg.len() != st.msg_words {
            return Err(self.raise(Error::InvalidParam));
        }
        if st.max_mesg > 1 {
            return Err(self.raise(Error::MesgQueueNotMailbox));
        }

        let was_empty = st.mesg_cnt == 0;
        st.write_idx = 0;
        st.read_idx = 0;
        // Safety: a mailbox's buffer is exactly `msg_words` words.
        let slot = st.buf;
        for (i, word) in msg.iter().enumerate() {
            unsafe { slot.add(i).write(*word) };
        }
        st.mesg_cnt = 1;
        #[cfg(feature = "mesgq_notify")]
        if let Some(cbk) = st.notify {
            cbk(mq.erased());
        }
        drop(token);
        drop(guard);

        if was_empty {
            wake_front_if(self, mq, TaskState::Receiving);
        }
        Ok(())
    }

    /// `kMesgQueueReset`: drop all buffered content and release every
    /// waiter. From ISR context, or with more than one waiter even from task
    /// context, the drain is deferred to the post-processing task —
    /// `original_source/core/src/kmesgq.c`'s exact deferral condition.
    pub fn mesgq_reset(&mut self, mq: &'static MesgQueueCb<P>) -> Result<()> {
        let to_wake = {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let st = mq.inner.get_mut(&mut token);
            MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
            st.waiting.len() as u32
        };

        if to_wake > 0 && (P::is_isr() || to_wake > 1) {
            self.postproc_enqueue(JobKind::MesgQueueReset, mq.erased(), to_wake);
            return Ok(());
        }

        self.drain_reset(mq, to_wake);
        Ok(())
    }

    /// Shared by [`Self::mesgq_reset`]'s immediate path and the
    /// post-processing task's deferred drain.
    fn drain_reset(&mut self, mq: &'static MesgQueueCb<P>, to_wake: u32) {
        {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let st = mq.inner.get_mut(&mut token);
            st.mesg_cnt = 0;
            st.write_idx = 0;
            st.read_idx = 0;
            st.owner = None;
            #[cfg(feature = "mesgq_notify")]
            {
                st.notify = None;
            }
        }

        if to_wake == 0 {
            return;
        }

        self.sched_lock();
        let mut chosen: Option<TaskIdx> = None;
        for _ in 0..to_wake {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let Some(next) = mq.inner.get_mut(&mut token).waiting.front() else {
                break;
            };
            mq.inner.get_mut(&mut token).waiting.remove(&mut self.tasks, next);
            if self.task(next).timeout_node.is_linked() {
                let node = &mut self.tasks[next.0 as usize].timeout_node as *mut _;
                unsafe { self.delta.remove(node) };
            }
            drop(token);
            drop(guard);
            self.task_mut(next).blocked_on = crate::task::BlockedOn::None;
            self.make_ready(next);
            chosen = match chosen {
                None => Some(next),
                Some(c) if self.task(next).priority < self.task(c).priority => Some(next),
                some_c => some_c,
            };
        }
        if chosen.is_some() {
            self.reschedule();
        }
        self.sched_unlock();
    }
}

/// Run a message queue reset that was deferred to the post-processing task.
///
/// # Safety
/// `target` must be the erased form of a live, initialized `MesgQueueCb<P>`,
/// and `arg` the waiter count that call computed.
pub(crate) unsafe fn run_deferred_reset<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    target: *const (),
    arg: u32,
) {
    // Safety: forwarded from the caller's precondition.
    let mq = unsafe { MesgQueueCb::<P>::from_erased(target) };
    kernel.drain_reset(mq, arg);
}

/// Unlink a timed-out task from `mq_ptr`'s waiting queue. Called only from
/// the tick handler's timeout path, under the kernel lock.
///
/// # Safety
/// `mq_ptr` must be the erased form of a live, initialized `MesgQueueCb<P>`,
/// and `idx` must currently be linked in its waiting queue.
pub(crate) unsafe fn remove_waiter<P: Port, const NTASKS: usize>(
    mq_ptr: *const (),
    tasks: &mut [crate::task::TaskCb; NTASKS],
    idx: TaskIdx,
) {
    // Safety: forwarded from caller's precondition.
    let mq = unsafe { MesgQueueCb::<P>::from_erased(mq_ptr) };
    let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
    let mut token = guard.borrow_mut();
    let st = mq.inner.get_mut(&mut token);
    st.waiting.remove(tasks, idx);
}

/// `kPortAdoptSenderPrio_`: after a server drains a request, pick up the
/// sender's priority for the duration of handling it (or fall back to the
/// server's own priority if the sender field is empty). Released by
/// [`Kernel::port_server_done`].
#[cfg(feature = "ports")]
fn port_adopt_sender_prio<P: Port, const NTASKS: usize, const NPRIO: usize>(
    kernel: &mut Kernel<P, NTASKS, NPRIO>,
    port: &'static MesgQueueCb<P>,
    msg: &[u32],
) {
    let owner = {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = port.inner.get_mut(&mut token);
        if st.is_server { st.owner } else { None }
    };
    let Some(owner) = owner else {
        return;
    };
    let sender_pid = msg[0];
    let new_prio = if sender_pid == 0 {
        kernel.task(owner).priority
    } else {
        kernel.task(TaskIdx((sender_pid - 1) as u8)).priority
    };
    if kernel.task(owner).priority == new_prio {
        return;
    }
    if kernel.task(owner).status == TaskState::Ready {
        kernel.remove_ready(owner);
        kernel.task_mut(owner).priority = new_prio;
        kernel.make_ready(owner);
    } else {
        kernel.task_mut(owner).priority = new_prio;
    }
}

#[cfg(feature = "ports")]
impl<P: Port, const NTASKS: usize, const NPRIO: usize> Kernel<P, NTASKS, NPRIO> {
    /// `kPortInit`: initialize the underlying queue and attach `owner` as
    /// both consumer and server in one call. `msg_words` must be at least
    /// [`PORT_META_WORDS`].
    pub fn port_init(
        &mut self,
        port: &'static MesgQueueCb<P>,
        buf: &'static mut [u32],
        msg_words: usize,
        n_mesg: usize,
        owner: TaskIdx,
    ) -> Result<()> {
        if msg_words < PORT_META_WORDS {
            return Err(self.raise(Error::InvalidParam));
        }
        port.init(buf, msg_words, n_mesg)?;
        self.mesgq_set_owner(port, owner)?;
        self.port_set_server(port, owner)
    }

    /// `kMesgQueueSetServer`/`kPortSetServer`: mark `owner` as the serving
    /// task. Unlike [`Self::mesgq_set_owner`] this always overwrites.
    pub fn port_set_server(&mut self, port: &'static MesgQueueCb<P>, owner: TaskIdx) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = port.inner.get_mut(&mut token);
        MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
        st.is_server = true;
        st.owner = Some(owner);
        Ok(())
    }

    /// `kPortSetOwner`.
    pub fn port_set_owner(&mut self, port: &'static MesgQueueCb<P>, owner: TaskIdx) -> Result<()> {
        self.mesgq_set_owner(port, owner)
    }

    /// `kMesgQueueServerDone`/`kPortServerDone`: drop the server back to its
    /// nominal priority once it is done handling the request it adopted a
    /// sender's priority for.
    pub fn port_server_done(&mut self, port: &'static MesgQueueCb<P>) -> Result<()> {
        let (is_server, owner) = {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let st = port.inner.get_mut(&mut token);
            MesgQueueCb::<P>::check_init(st).map_err(|e| self.raise(e))?;
            (st.is_server, st.owner)
        };
        if !is_server {
            return Ok(());
        }
        let Some(owner) = owner else {
            return Ok(());
        };
        let nominal = self.task(owner).base_priority;
        if self.task(owner).priority == nominal {
            return Ok(());
        }
        if self.task(owner).status == TaskState::Ready {
            self.remove_ready(owner);
            self.task_mut(owner).priority = nominal;
            self.make_ready(owner);
        } else {
            self.task_mut(owner).priority = nominal;
        }
        Ok(())
    }

    /// `kPortSend`: stamp the sender's handle into the message's metadata
    /// words, leave the reply-box slot empty, then send normally.
    pub fn port_send(&mut self, port: &'static MesgQueueCb<P>, msg: &mut [u32], timeout: Tick) -> Result<()> {
        if msg.len() < PORT_META_WORDS {
            return Err(self.raise(Error::InvalidParam));
        }
        let cur = self.current();
        msg[0] = cur.0 as u32 + 1;
        msg[1] = 0;
        self.mesgq_send(port, msg, timeout)
    }

    /// `kPortRecv`: receive normally, then adopt the sender's priority for
    /// the duration of handling the request.
    pub fn port_recv(&mut self, port: &'static MesgQueueCb<P>, msg: &mut [u32], timeout: Tick) -> Result<()> {
        if msg.len() < PORT_META_WORDS {
            return Err(self.raise(Error::InvalidParam));
        }
        self.mesgq_recv(port, msg, timeout)?;
        port_adopt_sender_prio(self, port, msg);
        Ok(())
    }

    /// `kPortSendRecv`: send a request then block for its reply on
    /// `reply_box`, a single-word mailbox the caller must have already
    /// initialized via [`MesgQueueCb::init_mailbox`] — unlike the original's
    /// lazy first-use `kMailboxInit`, this crate has no spare buffer to
    /// allocate one from at call time. A stale reply left behind by a
    /// previous timed-out transaction is drained before sending.
    pub fn port_send_recv(
        &mut self,
        port: &'static MesgQueueCb<P>,
        msg: &mut [u32],
        reply_box: &'static MesgQueueCb<P>,
        timeout: Tick,
    ) -> Result<u32> {
        if msg.len() < PORT_META_WORDS {
            return Err(self.raise(Error::InvalidParam));
        }

        {
            let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
            let mut token = guard.borrow_mut();
            let cur = self.current();
            let st = reply_box.inner.get_mut(&mut token);
            if !st.init || st.kind != ObjectKind::Mailbox {
                return Err(self.raise(Error::InvalidObject));
            }
            if let Some(owner) = st.owner {
                if owner != cur {
                    return Err(self.raise(Error::MesgQueueHasOwner));
                }
            }
            if st.mesg_cnt > 0 {
                let mut stale = [0u32; 1];
                read_message(st, &mut stale);
            }
        }

        let cur = self.current();
        msg[0] = cur.0 as u32 + 1;
        msg[1] = reply_box.erased() as usize as u32;

        self.mesgq_send(port, msg, timeout)?;

        let mut reply = [0u32; 1];
        let result = self.mesgq_recv(reply_box, &mut reply, timeout);
        if result == Err(Error::Timeout) {
            // Reserve the mailbox with a marker so a late server reply fails
            // fast rather than landing in a slot nobody is left to read.
            let _ = self.mesgq_post_ovw(reply_box, &[0]);
        }
        result?;
        Ok(reply[0])
    }

    /// `kPortReply`: post `reply_code` to the reply mailbox stashed in
    /// `msg`'s metadata by [`Self::port_send_recv`]. Never blocks.
    pub fn port_reply(&mut self, port: &'static MesgQueueCb<P>, msg: &[u32], reply_code: u32) -> Result<()> {
        if msg.len() < PORT_META_WORDS {
            return Err(self.raise(Error::InvalidParam));
        }
        let reply_ptr = msg[1] as usize as *const ();
        if reply_ptr.is_null() {
            return Err(self.raise(Error::ObjectNull));
        }
        let _ = port;
        // Safety: `reply_ptr` was stashed by `port_send_recv` as the erased
        // form of a live, `'static` mailbox `MesgQueueCb<P>`.
        let reply_box = unsafe { MesgQueueCb::<P>::from_erased(reply_ptr) };
        self.mesgq_post_ovw(reply_box, &[reply_code])
    }

    /// `kPortReplyDone`: reply, then demote back to nominal priority,
    /// reporting the reply's error if it failed rather than the demotion's.
    pub fn port_reply_done(&mut self, port: &'static MesgQueueCb<P>, msg: &[u32], reply_code: u32) -> Result<()> {
        let posted = self.port_reply(port, msg, reply_code);
        let demoted = self.port_server_done(port);
        posted.and(demoted)
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
    fn mailbox_post_then_recv_round_trips() {
        static mut BUF: [u32; 1] = [0];
        static MBOX: MesgQueueCb<HostPort> = MesgQueueCb::new();
        #[allow(static_mut_refs)]
        MBOX.init_mailbox(unsafe { &mut BUF }).unwrap();

        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        k.current = Some(TaskIdx(0));
        k.task_mut(TaskIdx(0)).status = TaskState::Running;

        k.mesgq_send(&MBOX, &[42], NO_WAIT).unwrap();
        let mut out = [0u32; 1];
        k.mesgq_recv(&MBOX, &mut out, NO_WAIT).unwrap();
        assert_eq!(out[0], 42);
        assert_eq!(k.mesgq_recv(&MBOX, &mut out, NO_WAIT), Err(Error::QueueEmpty));
    }

    #[test]
    fn queue_full_rejects_no_wait_send() {
        static mut BUF: [u32; 2] = [0, 0];
        static MQ: MesgQueueCb<HostPort> = MesgQueueCb::new();
        #[allow(static_mut_refs)]
        MQ.init(unsafe { &mut BUF }, 1, 2).unwrap();

        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        k.current = Some(TaskIdx(0));
        k.task_mut(TaskIdx(0)).status = TaskState::Running;

        k.mesgq_send(&MQ, &[1], NO_WAIT).unwrap();
        k.mesgq_send(&MQ, &[2], NO_WAIT).unwrap();
        assert_eq!(k.mesgq_send(&MQ, &[3], NO_WAIT), Err(Error::QueueFull));
        assert_eq!(k.mesgq_query(&MQ).unwrap(), 2);
    }

    #[test]
    fn jam_is_read_before_earlier_messages() {
        static mut BUF: [u32; 2] = [0, 0];
        static MQ: MesgQueueCb<HostPort> = MesgQueueCb::new();
        #[allow(static_mut_refs)]
        MQ.init(unsafe { &mut BUF }, 1, 2).unwrap();

        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        k.current = Some(TaskIdx(0));
        k.task_mut(TaskIdx(0)).status = TaskState::Running;

        k.mesgq_send(&MQ, &[1], NO_WAIT).unwrap();
        k.mesgq_jam(&MQ, &[99], NO_WAIT).unwrap();
        let mut out = [0u32; 1];
        k.mesgq_recv(&MQ, &mut out, NO_WAIT).unwrap();
        assert_eq!(out[0], 99);
        k.mesgq_recv(&MQ, &mut out, NO_WAIT).unwrap();
        assert_eq!(out[0], 1);
    }

    #[test]
    fn post_ovw_rejects_non_mailbox() {
        static mut BUF: [u32; 2] = [0, 0];
        static MQ: MesgQueueCb<HostPort> = MesgQueueCb::new();
        #[allow(static_mut_refs)]
        MQ.init(unsafe { &mut BUF }, 1, 2).unwrap();
        let mut k: Kernel<HostPort, 1, 4> = Kernel::new();
        assert_eq!(k.mesgq_post_ovw(&MQ, &[1]), Err(Error::InvalidObject));
    }
}
