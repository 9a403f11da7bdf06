//! Cortex-M0/M0+/M3/M4/M7 implementation of [`rk0_port::Port`].
//!
//! Out of the kernel's scope proper (`spec.md` §1 "OUT OF SCOPE"); this
//! crate is the CPU-port layer `rk0` is generic over, grounded on
//! `examples/r3-os-r3/src/r3_port_arm_m` (`threading::imp`,
//! `systick_tickful::imp`) and the simpler from-scratch Cortex-M port at
//! `examples/other_examples/f333cbfa_bbrown1867-rucos-rs__cortex-m-src-lib.rs.rs`
//! for the PendSV dispatch asm shape.
//!
//! A board crate names its concrete kernel instance with [`use_port!`],
//! which defines a zero-sized `Port` type, implements `rk0_port::Port` for
//! it, and wires `PendSV`/`SysTick`/`SVCall` to the named `static` kernel
//! via `cortex-m-rt`'s `#[exception]`/`#[interrupt]` attributes. The macro
//! exists (rather than one blanket impl) because [`rk0_port::Port::start_first_task`]
//! takes no arguments and must still reach into the board's specific
//! `Kernel<..>` static to find the first task's saved stack pointer —
//! exactly the problem `r3_port_arm_m`'s `use_port!` solves for the
//! teacher's own `PortThreading` trait.
#![no_std]

use core::arch::naked_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::{SCB, SYST};
#[cfg(feature = "primask")]
use cortex_m::register::primask;

/// Word painted across an idle stack so a debugger can estimate high-water
/// mark; re-exported so board crates don't need a direct `rk0-port` dep
/// just for this constant.
pub use rk0_port::{CriticalState, STACK_FILL_PATTERN, STACK_GUARD_WORD};

#[cfg(all(feature = "basepri", feature = "primask"))]
compile_error!("rk0-port-arm-m: select exactly one of the \"basepri\"/\"primask\" features");
#[cfg(not(any(feature = "basepri", feature = "primask")))]
compile_error!("rk0-port-arm-m: select exactly one of the \"basepri\"/\"primask\" features");

/// `BASEPRI` value `critical_enter` programs on Armv7-M+ boards built with
/// the `basepri` feature: masks every exception at this priority or lower,
/// grounded on `examples/r3-os-r3/src/r3_port_arm_m/src/threading/imp.rs`'s
/// `CPU_LOCK_PRIORITY_MASK`. `rk0` has no per-board priority configuration
/// layer, so unlike the teacher's trait constant this is a single fixed
/// level — boards needing a different split should fork this constant.
#[cfg(feature = "basepri")]
pub const CPU_LOCK_BASEPRI: u8 = 0x20;

/// Holds the tick-handler function pointer the board's `SysTick` exception
/// invokes, installed by [`Arch::program_systick`]. `rk0`'s tick handler is
/// a plain `fn() -> bool` (no captures), so a bare atomic is enough — no
/// `dyn Fn` / vtable machinery needed in an interrupt handler.
static TICK_HANDLER: AtomicU32 = AtomicU32::new(0);

fn tick_handler_ptr() -> Option<fn() -> bool> {
    let raw = TICK_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // Safety: only ever stored from `Arch::program_systick`, which
        // requires a `fn() -> bool`.
        Some(unsafe { core::mem::transmute::<usize, fn() -> bool>(raw as usize) })
    }
}

/// Shared building blocks every `use_port!`-generated type reuses. Not
/// `pub` API on its own — boards interact with the trait impl `use_port!`
/// generates, not this directly.
#[doc(hidden)]
pub struct Arch;

impl Arch {
    /// Armv6-M/Armv8-M-Baseline cores (Cortex-M0/M0+) have no `BASEPRI`, so
    /// the `primask` feature masks everything via `PRIMASK`. Armv7-M+ boards
    /// built with the `basepri` feature instead raise `BASEPRI` to
    /// [`CPU_LOCK_BASEPRI`], which only masks exceptions at or below that
    /// priority — letting a board reserve a higher-priority exception (e.g.
    /// a hard fault handler) that never observes CPU Lock at all, same
    /// tradeoff the teacher's port documents.
    #[cfg(feature = "basepri")]
    #[inline(always)]
    pub fn critical_enter() -> CriticalState {
        let was = cortex_m::register::basepri::read();
        unsafe { cortex_m::register::basepri::write(CPU_LOCK_BASEPRI) };
        CriticalState(was as u32)
    }

    #[cfg(feature = "primask")]
    #[inline(always)]
    pub fn critical_enter() -> CriticalState {
        let was_active = primask::read().is_active();
        cortex_m::interrupt::disable();
        CriticalState(was_active as u32)
    }

    /// # Safety
    /// `state` must be the value most recently returned by
    /// `critical_enter` on this core.
    #[cfg(feature = "basepri")]
    #[inline(always)]
    pub unsafe fn critical_exit(state: CriticalState) {
        unsafe { cortex_m::register::basepri::write(state.0 as u8) };
    }

    /// # Safety
    /// `state` must be the value most recently returned by
    /// `critical_enter` on this core.
    #[cfg(feature = "primask")]
    #[inline(always)]
    pub unsafe fn critical_exit(state: CriticalState) {
        if state.0 != 0 {
            // Safety: re-enabling interrupts here is only unsound if a
            // critical section is still logically held by an outer scope,
            // which the CriticalState token (returned exactly once per
            // `critical_enter`) rules out.
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    #[inline(always)]
    pub fn is_isr() -> bool {
        // Vector-active field of ICSR: 0 means Thread mode.
        (SCB::vect_active() as u16) != 0
    }

    #[inline(always)]
    pub fn pend_context_switch() {
        SCB::set_pendsv();
    }

    #[inline(always)]
    pub fn dmb() {
        cortex_m::asm::dmb();
    }

    #[inline(always)]
    pub fn dsb() {
        cortex_m::asm::dsb();
    }

    #[inline(always)]
    pub fn isb() {
        cortex_m::asm::isb();
    }

    #[inline(always)]
    pub fn wfi() {
        cortex_m::asm::wfi();
    }

    /// Build the 17-word synthetic exception frame (`rk0_port::INITIAL_FRAME_WORDS`):
    /// 8 callee-saved registers (R4-R11) + a synthetic `EXC_RETURN` word +
    /// the 8 hardware-saved registers (R0-R3, R12, LR, PC, xPSR), low
    /// address first, matching what [`Self::pendsv_trampoline`] pops on
    /// first dispatch.
    ///
    /// # Safety
    /// `stack` must be exclusively owned by the new task for its entire
    /// lifetime and large enough to hold the frame plus the task's working
    /// set.
    pub unsafe fn init_task_stack(
        stack: &mut [usize],
        entry: unsafe extern "C" fn(*mut ()),
        arg: *mut (),
    ) -> *mut usize {
        let n = stack.len();
        assert!(n > rk0_port::INITIAL_FRAME_WORDS + 1, "rk0: task stack too small for initial frame");

        stack[0] = STACK_GUARD_WORD;
        for word in &mut stack[1..n - rk0_port::INITIAL_FRAME_WORDS] {
            *word = STACK_FILL_PATTERN;
        }

        let top = unsafe { stack.as_mut_ptr().add(n) };
        // Safety: `top` points one-past-the-end of `stack`; every offset
        // below subtracts at least 1 and stays within `stack`'s bounds
        // (checked by the length assertion above).
        unsafe {
            let mut sp = top;
            sp = sp.sub(1);
            sp.write(0x0100_0000); // xPSR: Thumb bit set
            sp = sp.sub(1);
            sp.write(entry as usize); // PC
            sp = sp.sub(1);
            sp.write(task_returned as usize); // LR: hardware return address
            sp = sp.sub(1);
            sp.write(0x1212_1212); // R12
            sp = sp.sub(1);
            sp.write(0x0303_0303); // R3
            sp = sp.sub(1);
            sp.write(0x0202_0202); // R2
            sp = sp.sub(1);
            sp.write(0x0101_0101); // R1
            sp = sp.sub(1);
            sp.write(arg as usize); // R0: task-args pointer
            sp = sp.sub(1);
            sp.write(0xFFFF_FFFD); // EXC_RETURN: thread mode, PSP, no FP
            sp = sp.sub(1);
            sp.write(0x1111_1111); // R11
            sp = sp.sub(1);
            sp.write(0x1010_1010); // R10
            sp = sp.sub(1);
            sp.write(0x0909_0909); // R9
            sp = sp.sub(1);
            sp.write(0x0808_0808); // R8
            sp = sp.sub(1);
            sp.write(0x0707_0707); // R7
            sp = sp.sub(1);
            sp.write(0x0606_0606); // R6
            sp = sp.sub(1);
            sp.write(0x0505_0505); // R5
            sp = sp.sub(1);
            sp.write(0x0404_0404); // R4
            sp
        }
    }

    /// Program `SYST` for a periodic tick of `reload` core-clock cycles and
    /// remember `tick_handler` for the `SysTick` exception `use_port!`
    /// generates to call.
    pub fn program_systick(syst: &mut SYST, reload: u32, tick_handler: fn() -> bool) {
        use cortex_m::peripheral::syst::SystClkSource;
        TICK_HANDLER.store(tick_handler as usize as u32, Ordering::Release);
        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(reload);
        syst.clear_current();
        syst.enable_interrupt();
        syst.enable_counter();
    }

    /// Shared body of the board's `SysTick` exception handler.
    pub fn on_systick() {
        if let Some(handler) = tick_handler_ptr() {
            if handler() {
                Self::pend_context_switch();
            }
        }
    }

    /// Naked PendSV trampoline: save the outgoing task's callee-saved
    /// context onto its own stack, call `switch_next` (via the board's
    /// `#[no_mangle] extern "C" fn rk0_switch_next() -> *mut usize`
    /// `use_port!` generates over its concrete `Kernel`), and restore the
    /// incoming task's context. Every register named here is caller/callee
    /// convention per the exception entry/exit contract, not a choice this
    /// port makes freely.
    ///
    /// # Safety
    /// Must only ever be installed as the `PendSV` exception handler.
    #[unsafe(naked)]
    pub unsafe extern "C" fn pendsv_trampoline() {
        naked_asm!(
            "mrs    r0, psp",
            "stmdb  r0!, {{r4-r11, r14}}",
            "bl     {switch}",
            "ldmia  r0!, {{r4-r11, r14}}",
            "msr    psp, r0",
            "bx     lr",
            switch = sym rk0_switch_next_trampoline,
        )
    }
}

/// # Safety
/// Called only from within [`Arch::pendsv_trampoline`], after the outgoing
/// task's context has been pushed; reads/writes `PSP` via the board's
/// registered switch function.
#[no_mangle]
extern "C" fn rk0_switch_next_trampoline(outgoing_psp: *mut usize) -> *mut usize {
    // Safety: only ever stored by a `use_port!`-generated `extern "C"`
    // thunk over the board's concrete `Kernel<..>`, which matches this
    // signature exactly.
    let switch = SWITCH_NEXT.load(Ordering::Acquire);
    assert_ne!(switch, 0, "rk0: use_port! never registered a switch_next thunk");
    let switch: extern "C" fn(*mut usize) -> *mut usize = unsafe { core::mem::transmute(switch as usize) };
    switch(outgoing_psp)
}

static SWITCH_NEXT: AtomicU32 = AtomicU32::new(0);

/// Registered by [`use_port!`] with the board's concrete
/// `Kernel<..>::switch_next`, adapted to take/return the outgoing PSP.
#[doc(hidden)]
pub fn register_switch_next(f: extern "C" fn(*mut usize) -> *mut usize) {
    SWITCH_NEXT.store(f as usize as u32, Ordering::Release);
}

/// A task function returned instead of blocking forever; `rk0` task
/// bodies are documented as `loop {}` entry points and never legitimately
/// reach here, so this is a fault rather than a graceful exit.
unsafe extern "C" fn task_returned() -> ! {
    panic!("rk0: task entry function returned");
}

/// Declares a zero-sized port type named `$port`, implements
/// [`rk0_port::Port`] for it against the `static mut $kernel: Kernel<$port, ..>`
/// named at the call site, and generates the `PendSV`/`SysTick` exception
/// handlers `cortex-m-rt` dispatches to. Invoked once per board binary.
/// `$kernel` names a `static mut`, not an expression, because
/// [`rk0_port::Port::start_first_task`] takes no arguments and must still
/// reach into the board's specific kernel instance to find the first
/// task's saved stack pointer.
///
/// ```ignore
/// static mut KERNEL: rk0::Kernel<ArmM, 8, 4> = rk0::Kernel::new();
/// rk0_port_arm_m::use_port!(unsafe struct ArmM => KERNEL);
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $port:ident => $kernel:ident) => {
        pub struct $port;

        unsafe impl $crate::rk0_port::Port for $port {
            fn critical_enter() -> $crate::rk0_port::CriticalState {
                $crate::Arch::critical_enter()
            }
            unsafe fn critical_exit(state: $crate::rk0_port::CriticalState) {
                unsafe { $crate::Arch::critical_exit(state) }
            }
            fn is_isr() -> bool {
                $crate::Arch::is_isr()
            }
            fn pend_context_switch() {
                $crate::Arch::pend_context_switch()
            }
            fn start_first_task() -> ! {
                $crate::register_switch_next(rk0_switch_next_thunk);
                // Safety: single core; `start_first_task` runs once at
                // boot, strictly after `Kernel::start` set `current`.
                let k = unsafe { &mut *core::ptr::addr_of_mut!($kernel) };
                let sp = k.task(k.current()).sp_slot();
                unsafe { $crate::start_first_task_asm(sp) }
            }
            fn dmb() {
                $crate::Arch::dmb()
            }
            fn dsb() {
                $crate::Arch::dsb()
            }
            fn isb() {
                $crate::Arch::isb()
            }
            fn wfi() {
                $crate::Arch::wfi()
            }
            unsafe fn init_task_stack(
                stack: &mut [usize],
                entry: unsafe extern "C" fn(*mut ()),
                arg: *mut (),
            ) -> *mut usize {
                unsafe { $crate::Arch::init_task_stack(stack, entry, arg) }
            }
            fn program_systick(reload: u32, tick_handler: fn() -> bool) {
                let mut syst = unsafe { cortex_m::Peripherals::steal().SYST };
                $crate::Arch::program_systick(&mut syst, reload, tick_handler)
            }
        }

        extern "C" fn rk0_switch_next_thunk(outgoing_psp: *mut usize) -> *mut usize {
            // Safety: called only from `Arch::pendsv_trampoline`'s call into
            // `rk0_switch_next_trampoline`, strictly after the caller
            // pushed the outgoing task's callee-saved context at
            // `outgoing_psp`, and only ever from within `PendSV` (single
            // core, so no concurrent caller exists).
            let k = unsafe { &mut *core::ptr::addr_of_mut!($kernel) };
            k.task_mut(k.current()).sp = outgoing_psp;
            k.switch_next()
        }

        #[cortex_m_rt::exception]
        fn PendSV() {
            unsafe { $crate::Arch::pendsv_trampoline() }
        }

        #[cortex_m_rt::exception]
        fn SysTick() {
            $crate::Arch::on_systick()
        }
    };
}

#[doc(hidden)]
pub use rk0_port;

/// Naked asm that loads `sp` into `PSP`, switches the core to use PSP, and
/// pops the synthetic frame [`Arch::init_task_stack`] built, landing in the
/// first task. Never returns.
///
/// # Safety
/// `sp` must point at a frame built by [`Arch::init_task_stack`].
#[unsafe(naked)]
pub unsafe extern "C" fn start_first_task_asm(sp: *mut usize) -> ! {
    naked_asm!(
        "cpsid   i",
        "msr     psp, r0",
        "mrs     r1, control",
        "orr     r1, r1, #2", // SPSEL = 1 (use PSP)
        "bic     r1, r1, #4", // FPCA = 0
        "msr     control, r1",
        "isb",
        "ldmia   sp!, {{r4-r11, r14}}",
        "ldmia   sp!, {{r0-r3}}",
        "ldmia   sp!, {{r12, r14}}",
        "ldmia   sp!, {{r1, r2}}", // r1 = PC, r2 = discarded xPSR
        "cpsie   i",
        "bx      r1",
    )
}
