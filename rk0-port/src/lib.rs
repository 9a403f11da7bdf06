//! The CPU-port contract.
//!
//! This crate defines the boundary between the portable kernel (`rk0`) and
//! the architecture-specific glue that actually saves/restores registers,
//! programs the interrupt controller, and drives the system timer. It does
//! not implement anything itself — see `rk0-port-arm-m` for a concrete
//! Cortex-M implementation.
//!
//! The contract mirrors what a CPU port is expected to provide in a
//! preemptive, priority-based kernel: a way to disable/enable interrupts for
//! short critical sections, a way to request a context switch without
//! performing one synchronously, and a way to synthesize the initial
//! register frame a brand-new task needs before its first dispatch.
#![no_std]

use core::fmt;

/// Number of words in the synthetic exception frame a [`Port`] must be able
/// to build: 8 hardware-saved registers (R0-R3, R12, LR, PC, xPSR) plus 8
/// callee-saved registers (R4-R11) pushed by the context-switch trap.
pub const INITIAL_FRAME_WORDS: usize = 17;

/// Opaque token proving a critical section (CPU Lock) is currently held.
///
/// Ports construct this from whatever representation their interrupt-mask
/// save/restore primitive returns (e.g. the saved `PRIMASK`/`BASEPRI` on
/// Cortex-M); the kernel never inspects its contents.
#[derive(Clone, Copy)]
pub struct CriticalState(pub u32);

/// The CPU-port contract (`spec.md` §4.1, §6).
///
/// # Safety
///
/// Implementors must guarantee mutual exclusion between
/// [`Port::critical_enter`]/[`Port::critical_exit`] pairs and any
/// interrupt handler that calls back into the kernel (tick ISR, other
/// peripheral ISRs that post to kernel objects). Violating this contract
/// lets two execution contexts observe kernel state mid-mutation, which is
/// undefined behavior from the kernel's point of view.
pub unsafe trait Port: Sized + 'static {
    /// Disable all kernel-managed interrupts and return a token that can
    /// later be used to restore the previous state. Nestable: entering
    /// while already inside a critical section is legal and must compose
    /// (the usual implementation saves the interrupt-mask register).
    fn critical_enter() -> CriticalState;

    /// Restore the interrupt-mask state captured by a matching
    /// [`Port::critical_enter`].
    ///
    /// # Safety
    /// `state` must be the value most recently returned by
    /// `critical_enter` on this execution context; restoring an
    /// out-of-order or foreign state corrupts the nesting invariant.
    unsafe fn critical_exit(state: CriticalState);

    /// `true` if the calling context is an interrupt handler.
    fn is_isr() -> bool;

    /// Arrange for a context-switch trap to run at the earliest safe
    /// opportunity (after the current ISR chain unwinds, or immediately if
    /// called from a task). Must be safe to call from within a critical
    /// section; must not itself perform the switch synchronously.
    fn pend_context_switch();

    /// Hand control to the task whose context was most recently prepared
    /// with [`Port::init_task_stack`] and selected by the kernel as the
    /// first task to run. Called exactly once, at boot, after
    /// `kApplicationInit` and the first user `kCreateTask` calls have run.
    ///
    /// Never returns.
    fn start_first_task() -> !;

    /// Index of the lowest set bit in `bitmap`, or 32 if `bitmap == 0`.
    fn ctz32(bitmap: u32) -> u32 {
        bitmap.trailing_zeros()
    }

    /// Data memory barrier.
    fn dmb();
    /// Data synchronization barrier.
    fn dsb();
    /// Instruction synchronization barrier.
    fn isb();
    /// Wait-for-interrupt: park the core until the next interrupt.
    fn wfi();

    /// Build the synthetic exception frame for a brand-new task so that its
    /// first dispatch restores R0 = `arg`, PC = `entry`, xPSR with the
    /// Thumb bit set, and identifiable sentinels in R4-R11. `stack` is the
    /// task's stack region (lowest address first); the implementation
    /// paints the region below the frame with [`STACK_FILL_PATTERN`] and
    /// writes [`STACK_GUARD_WORD`] at `stack[0]`.
    ///
    /// Returns the initial stack pointer value to store in the TCB.
    ///
    /// # Safety
    /// `stack` must be a region this task exclusively owns for its entire
    /// lifetime; `entry` must be a valid task-entry function pointer.
    unsafe fn init_task_stack(
        stack: &mut [usize],
        entry: unsafe extern "C" fn(*mut ()),
        arg: *mut (),
    ) -> *mut usize;

    /// Program the system timer to fire `tick_handler` every `reload`
    /// core-clock cycles, pending a context switch whenever the handler
    /// reports one is needed.
    fn program_systick(reload: u32, tick_handler: fn() -> bool);
}

/// Word painted across the unused portion of a fresh task stack, to aid
/// stack-usage inspection in a debugger.
pub const STACK_FILL_PATTERN: usize = 0xCDCD_CDCD;

/// Word written at the lowest address of every task stack; a context
/// switch that finds this word overwritten indicates a stack overflow
/// (`spec.md` §7 "System faults").
pub const STACK_GUARD_WORD: usize = 0xDEAD_BEEF;

/// A parameter or state-transition request that the port layer rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortError;

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("port contract violation")
    }
}
