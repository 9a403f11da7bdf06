//! Kernel state locking: the global critical section ("CPU Lock").
//!
//! Every piece of kernel-owned mutable state (ready queues, TCBs, waiting
//! queues, delta-list heads, the tick counter, the scheduler-lock counter)
//! is wrapped in a [`CpuLockCell`] and may only be read or written while
//! holding a [`CpuLockGuard`]. Since the target is single-core, disabling
//! interrupts for the lifetime of the guard is sufficient mutual exclusion;
//! there is no fine-grained locking anywhere in the kernel.
use core::{fmt, marker::PhantomData, ops};
use rk0_port::Port;
use tokenlock::UnsyncTokenLock;

/// Per-port tag type so that [`CpuLockToken`] is a distinct singleton for
/// every CPU port a binary links against.
pub struct CpuLockTag<P>(PhantomData<P>);

/// The key that "unlocks" a [`CpuLockCell`].
pub type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;

/// The keyhole type [`CpuLockCell`] is parameterized over.
pub type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// A cell that can only be accessed through a live [`CpuLockToken`], i.e.
/// while interrupts are disabled on this port.
pub struct CpuLockCell<P, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub const fn new(value: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::<P>::new(), value))
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<P, T: fmt::Debug + Clone> fmt::Debug for CpuLockCell<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CpuLockCell(..)")
    }
}

/// RAII guard for an active critical section. Dropping it re-enables
/// interrupts (unless this was a nested entry, in which case the port's own
/// nesting counter keeps them masked).
pub struct CpuLockGuard<P: Port> {
    state: rk0_port::CriticalState,
    token: CpuLockToken<P>,
}

impl<P: Port> CpuLockGuard<P> {
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        // Safety: `state` was obtained from the matching `critical_enter`
        // that produced this guard; no other `CpuLockGuard` for `P` can be
        // alive at the same time since `CpuLockToken<P>` is a singleton.
        unsafe { P::critical_exit(self.state) }
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

pub type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;
pub type CpuLockTokenRef<'a, P> = tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<P>>;

/// Enter the critical section. Returns `None` if a [`CpuLockToken`] is
/// already checked out on this port (i.e. the kernel tried to recursively
/// lock itself, which is always a logic error rather than legitimate ISR
/// nesting — ISR nesting is handled by the port's interrupt-mask counter,
/// not by re-entering this function).
pub fn lock<P: Port>() -> Option<CpuLockGuard<P>> {
    let token = CpuLockToken::<P>::new()?;
    let state = P::critical_enter();
    Some(CpuLockGuard { state, token })
}

/// Assume the critical section is already active and fabricate a guard.
///
/// # Safety
/// The caller must guarantee interrupts are currently masked on this port
/// and that no other [`CpuLockGuard<P>`] exists.
pub unsafe fn assume_locked<P: Port>(state: rk0_port::CriticalState) -> CpuLockGuard<P> {
    CpuLockGuard {
        state,
        // Safety: upheld by the caller.
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}
