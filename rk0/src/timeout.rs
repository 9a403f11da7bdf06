//! C4: the timeout delta-list.
//!
//! Grounded on `original_source/core/src/ktimer.c`: a singly-headed,
//! doubly-linked list ordered by remaining ticks, where every node but the
//! head stores the *delta* to the node in front of it rather than an
//! absolute deadline. Advancing the tick only ever decrements the head's
//! delta, and removing a node (whether it times out or is cancelled early)
//! folds its remaining delta into its successor — both O(1), independent of
//! list length.
//!
//! Nodes are embedded in heterogeneous owners (a [`crate::task::TaskCb`]
//! inside the kernel's task pool, or a [`crate::timer::TimerCb`] the
//! application declares with `'static` storage), so unlike the ready/waiting
//! queues in [`crate::list`] this list is linked through raw pointers to the
//! embedded [`TimeoutNode`] fields rather than pool indices.
use core::ptr;

use crate::task::TaskIdx;

/// Why a node is on the delta-list — mirrors
/// `original_source/core/inc/kcommondefs.h`'s `RK_TIMEOUT_*` codes, used to
/// decide how the owner is woken when the node reaches the head and expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Bounded wait on a semaphore/mutex/message queue waiting queue.
    Blocking,
    /// Bounded wait on task event flags.
    EventFlags,
    /// A callout timer's next firing.
    Call,
    /// `kSleep`/`kSleepUntil`/`kSleepPeriodic`.
    TimeEvent,
}

/// What a timeout node belongs to. Needed because the delta-list has to
/// notify different things on expiry: wake a task, or fire a timer.
/// `Owner::Timer` is opaque (`*mut ()`, the erased form of a `TimerCb<P>`)
/// since `TimeoutNode`/`DeltaList` are shared by every port instantiation
/// while `TimerCb` is generic over the port; `crate::timer` casts it back
/// knowing its own `P` from context.
#[derive(Clone, Copy)]
pub enum Owner {
    Task(TaskIdx),
    Timer(*mut ()),
    None,
}

pub struct TimeoutNode {
    prev: *mut TimeoutNode,
    next: *mut TimeoutNode,
    pub kind: TimeoutKind,
    pub owner: Owner,
    /// Ticks remaining until this node's own deadline, *after* accounting
    /// for the deltas of every node ahead of it (i.e. `dtick` in the
    /// original, not an absolute tick value).
    dtick: u32,
    linked: bool,
}

// Safety: the raw `prev`/`next`/`Owner::Timer` pointers are only ever
// dereferenced from within the kernel's critical section.
unsafe impl Send for TimeoutNode {}

impl TimeoutNode {
    pub const fn new() -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            kind: TimeoutKind::Blocking,
            owner: Owner::None,
            dtick: 0,
            linked: false,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

impl Default for TimeoutNode {
    fn default() -> Self {
        Self::new()
    }
}

/// The delta-list head. Holds only a pointer to the first node; every other
/// node is reached by following `next` links, exactly as
/// `original_source/core/src/ktimer.c`'s single `currTimerPtr`-rooted list.
pub struct DeltaList {
    head: *mut TimeoutNode,
}

// Safety: see `TimeoutNode`.
unsafe impl Send for DeltaList {}

impl DeltaList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Insert `node` (not currently linked) to expire in `ticks_from_now`
    /// ticks, threading it in relative to the existing nodes' deltas.
    ///
    /// # Safety
    /// `node` must remain valid and unmoved for as long as it stays linked.
    pub unsafe fn insert(&mut self, node: *mut TimeoutNode, kind: TimeoutKind, owner: Owner, ticks_from_now: u32) {
        unsafe {
            (*node).kind = kind;
            (*node).owner = owner;
            (*node).linked = true;
        }

        let mut remaining = ticks_from_now;
        let mut prev: *mut TimeoutNode = ptr::null_mut();
        let mut cursor = self.head;

        while !cursor.is_null() {
            let cur_dtick = unsafe { (*cursor).dtick };
            if remaining < cur_dtick {
                break;
            }
            remaining -= cur_dtick;
            prev = cursor;
            cursor = unsafe { (*cursor).next };
        }

        unsafe {
            (*node).dtick = remaining;
            (*node).prev = prev;
            (*node).next = cursor;
        }
        if !cursor.is_null() {
            unsafe { (*cursor).dtick -= remaining };
            unsafe { (*cursor).prev = node };
        }
        if prev.is_null() {
            self.head = node;
        } else {
            unsafe { (*prev).next = node };
        }
    }

    /// Unlink `node` early (cancellation), folding its remaining delta into
    /// its successor so the successor's absolute deadline is unchanged —
    /// `original_source/core/src/ktimer.c`'s `kRemoveTimerNode`.
    ///
    /// # Safety
    /// `node` must currently be linked in this list.
    pub unsafe fn remove(&mut self, node: *mut TimeoutNode) {
        debug_assert!(unsafe { (*node).linked });
        let prev = unsafe { (*node).prev };
        let next = unsafe { (*node).next };
        let dtick = unsafe { (*node).dtick };

        if !next.is_null() {
            unsafe { (*next).dtick += dtick };
            unsafe { (*next).prev = prev };
        }
        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { (*prev).next = next };
        }

        unsafe {
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();
            (*node).dtick = 0;
            (*node).linked = false;
        }
    }

    /// Decrement the head's delta by one tick (`spec.md` §4.7 tick
    /// handler). While the head's delta is now zero, pop it and hand it to
    /// `on_expire`, then continue to the new head — several timers can
    /// legitimately share one tick.
    pub fn advance_one_tick(&mut self, mut on_expire: impl FnMut(TimeoutKind, Owner)) {
        if self.head.is_null() {
            return;
        }
        unsafe {
            (*self.head).dtick -= 1;
        }
        while !self.head.is_null() && unsafe { (*self.head).dtick } == 0 {
            let node = self.head;
            let (kind, owner) = unsafe { ((*node).kind, (*node).owner) };
            unsafe { self.remove(node) };
            on_expire(kind, owner);
        }
    }
}

impl Default for DeltaList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> TimeoutNode {
        TimeoutNode::new()
    }

    #[test]
    fn single_node_expires_after_n_ticks() {
        let mut list = DeltaList::new();
        let mut n = node();
        unsafe {
            list.insert(&mut n, TimeoutKind::TimeEvent, Owner::Task(TaskIdx(0)), 3);
        }
        let mut expired = 0;
        for _ in 0..2 {
            list.advance_one_tick(|_, _| expired += 1);
        }
        assert_eq!(expired, 0);
        list.advance_one_tick(|_, _| expired += 1);
        assert_eq!(expired, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn staggered_nodes_expire_in_order() {
        let mut list = DeltaList::new();
        let mut a = node();
        let mut b = node();
        let mut c = node();
        unsafe {
            list.insert(&mut a, TimeoutKind::Blocking, Owner::Task(TaskIdx(0)), 5);
            list.insert(&mut b, TimeoutKind::Blocking, Owner::Task(TaskIdx(1)), 2);
            list.insert(&mut c, TimeoutKind::Blocking, Owner::Task(TaskIdx(2)), 5);
        }
        let mut order = Vec::new();
        for _ in 0..5 {
            list.advance_one_tick(|_, owner| {
                if let Owner::Task(idx) = owner {
                    order.push(idx.0);
                }
            });
        }
        // b at 2, then a and c both at 5 (a inserted first so sits ahead of
        // c with equal total delay).
        assert_eq!(order, vec![1, 0, 2]);
        assert!(list.is_empty());
    }

    #[test]
    fn early_cancellation_preserves_successor_deadline() {
        let mut list = DeltaList::new();
        let mut a = node();
        let mut b = node();
        unsafe {
            list.insert(&mut a, TimeoutKind::Blocking, Owner::Task(TaskIdx(0)), 3);
            list.insert(&mut b, TimeoutKind::Blocking, Owner::Task(TaskIdx(1)), 5);
            list.remove(&mut a);
        }
        let mut expired_at = None;
        for t in 1..=5 {
            list.advance_one_tick(|_, _| expired_at = Some(t));
        }
        assert_eq!(expired_at, Some(5));
    }
}
