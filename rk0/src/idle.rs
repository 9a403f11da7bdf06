//! C16: the idle task. Runs at the lowest priority in the system,
//! dispatched only when every other task is blocked or sleeping. Grounded
//! on `original_source/core/src/ksystasks.c`'s `IdleTask` (created
//! alongside the post-processing task at `kApplicationInit` time, see
//! `crate::sched::init_system_tasks`): a `WFI` loop, never anything that
//! could block.
use core::sync::atomic::{AtomicU32, Ordering};

use rk0_port::Port;

/// Number of times the idle task has been dispatched since boot. Not
/// gated behind a feature: it is a single atomic increment, cheap enough
/// to keep unconditionally, and it is the only externally visible way to
/// confirm "the system was ever idle" in a test or a debugger without
/// instrumenting the scheduler itself.
static IDLE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Number of times the idle task has run to completion of one loop body.
pub fn idle_count() -> u32 {
    IDLE_COUNT.load(Ordering::Relaxed)
}

/// Idle task entry point, installed by
/// [`crate::sched::Kernel::init_system_tasks`]. Never returns; parks the
/// core between interrupts rather than spinning, since there is never
/// useful work to poll for here — any real work arrives as a wake from the
/// tick handler or another task and will preempt this loop immediately
/// (idle is the lowest priority in the system).
pub unsafe extern "C" fn idle_entry<P: Port>(_arg: *mut ()) {
    loop {
        IDLE_COUNT.fetch_add(1, Ordering::Relaxed);
        P::dsb();
        P::wfi();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_count_starts_at_zero_and_is_monotonic() {
        let before = idle_count();
        IDLE_COUNT.fetch_add(1, Ordering::Relaxed);
        assert_eq!(idle_count(), before + 1);
    }
}
