//! C3: the ready-queue presence bitmap.
//!
//! One bit per priority level, set while that level's [`crate::list::TaskQueue`]
//! is non-empty. `original_source/core/src/ksch.c` keeps an equivalent
//! `readyQBitMask` and finds the highest-priority non-empty level with a
//! count-trailing-zeros instruction; `rk0` caps `MIN_PRIO` (the lowest,
//! numerically largest priority) at 32 so a single `u32` suffices rather than
//! the teacher's two-level `FixedPrioBitmap`.
use rk0_port::Port;

#[derive(Clone, Copy, Debug, Default)]
pub struct ReadyBitmap(u32);

impl ReadyBitmap {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, prio: u8) {
        self.0 |= 1 << prio;
    }

    pub fn clear(&mut self, prio: u8) {
        self.0 &= !(1 << prio);
    }

    pub fn is_set(&self, prio: u8) -> bool {
        self.0 & (1 << prio) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Index of the highest-priority (lowest-numbered) set bit, or `None` if
    /// no ready task exists at any priority.
    pub fn highest<P: Port>(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(P::ctz32(self.0) as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

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
    fn empty_has_no_highest() {
        let b = ReadyBitmap::new();
        assert_eq!(b.highest::<HostPort>(), None);
    }

    #[test]
    fn highest_is_lowest_numbered_set_bit() {
        let mut b = ReadyBitmap::new();
        b.set(5);
        b.set(2);
        b.set(9);
        assert_eq!(b.highest::<HostPort>(), Some(2));
        b.clear(2);
        assert_eq!(b.highest::<HostPort>(), Some(5));
    }

    #[quickcheck]
    fn highest_matches_linear_scan(bits: Vec<u8>) -> bool {
        let mut b = ReadyBitmap::new();
        for &bit in &bits {
            b.set(bit % 32);
        }
        let expected = (0..32).find(|&p| b.is_set(p));
        b.highest::<HostPort>() == expected
    }
}
