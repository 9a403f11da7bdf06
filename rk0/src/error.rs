//! Kernel error taxonomy (`spec.md` §7).
//!
//! Every public entry point returns `Result<T, Error>`. `Error` folds the
//! original kernel's three bands — success, transient "can't proceed now"
//! outcomes, and fatal/programmer errors — into one enum; [`Error::is_fault`]
//! tells the two bands apart for callers (and the fault hook) that need to.

/// Outcome of a kernel call that did not fully succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // --- transient, non-fatal: normal control flow of a try-mode call ---
    /// The object was already locked/full/empty/blocked and the caller
    /// passed `NO_WAIT`.
    WouldBlock,
    /// A bounded wait expired before the condition was met.
    Timeout,
    /// `kTaskEventGet` returned without clearing the requested bits.
    FlagsNotMet,
    /// `kSleepUntil`/`kSleepPeriodic` observed an overrun of at least one
    /// full period.
    ElapsedPeriod,
    /// `kSemaphoreFlush` on a semaphore with no blocked waiters.
    EmptyWaitingQueue,
    /// `kMesgQueueSend`/`Jam`/`PostOvw` found the queue full.
    QueueFull,
    /// `kMesgQueueRecv`/`Peek` found the queue empty.
    QueueEmpty,
    /// `kMemAlloc`/`kMRMReserve` found no free block; the caller is expected
    /// to retry later rather than treat this as a bug.
    MemPoolExhausted,

    // --- fatal / programmer errors ---
    /// A `NULL`/uninitialized object pointer was passed.
    ObjectNull,
    /// The object's `kXxxInit` has not run yet.
    ObjectNotInit,
    /// `kXxxInit` was called twice on the same object.
    ObjectDoubleInit,
    /// The object's kind tag did not match the operation attempted on it
    /// (e.g. calling a mutex operation on a semaphore).
    InvalidObject,
    /// A parameter was out of its documented range (priority, timeout,
    /// message size, stack size, ...).
    InvalidParam,
    /// A bounded timeout outside `1..=MAX_PERIOD` (and not `WAIT_FOREVER`).
    InvalidTimeout,
    /// A blocking primitive, or one otherwise forbidden in ISR context, was
    /// called from an ISR.
    InvalidIsrUse,
    /// The task attempted to lock a mutex it already owns.
    MutexRecursiveLock,
    /// `kMutexUnlock` called by a task that does not own the mutex.
    MutexNotOwner,
    /// `kMutexUnlock` called on a mutex that is not locked.
    MutexNotLocked,
    /// The task was not in the state required for the requested operation.
    TaskInvalidState,
    /// `kMesgQueueSetOwner` called on a queue that already has an owner.
    MesgQueueHasOwner,
    /// `kMesgQueueRecv` called by a task other than the queue's owner.
    MesgQueueNotOwner,
    /// A mailbox-only operation was attempted on a queue with capacity > 1.
    MesgQueueNotMailbox,
    /// `kMemFree` called on a partition that already has every block free
    /// (almost always a double-free).
    MemDoubleFree,

    // --- system faults ---
    /// The guard word at the bottom of a task's stack was found trampled.
    StackOverflow,
    /// More tasks were created than `NTASKS` provides slots for.
    TaskCountMismatch,
    /// `kTimerCancel` (or equivalent) called on a node not in its delta-list.
    NotTimedOut,
}

impl Error {
    /// `true` for the fatal/programmer and system-fault bands (`spec.md`
    /// §7): these additionally invoke the fault handler when
    /// `fault_check` is enabled. `false` for outcomes a well-behaved
    /// try-mode caller should expect in normal operation.
    pub const fn is_fault(self) -> bool {
        !matches!(
            self,
            Error::WouldBlock
                | Error::Timeout
                | Error::FlagsNotMet
                | Error::ElapsedPeriod
                | Error::EmptyWaitingQueue
                | Error::QueueFull
                | Error::QueueEmpty
                | Error::MemPoolExhausted
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;
