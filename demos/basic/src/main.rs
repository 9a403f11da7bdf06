//! Three-task priority preemption demo, `spec.md` §8 scenario 1: three
//! tasks at priorities 1, 2, 3, each `loop { sleep(10 ticks) }`. Within the
//! first 30 ticks T1 runs before T2, T2 before T3, and the idle task runs
//! only while all three are sleeping.
//!
//! Grounded on `examples/r3-os-r3/examples/basic/src/main.rs`'s shape
//! (one `#[entry]`, a handful of `Task`s, a shared object), adapted from
//! the teacher's `r3::build!`/`CfgBuilder` compile-time configuration to
//! `rk0`'s const-generic `Kernel<P, NTASKS, NPRIO>` plus explicit
//! `create_task` calls, since `rk0` has no declarative configuration
//! layer (`spec.md` Non-goals: no dynamic task creation after boot, but
//! nothing rules out plain imperative boot-time creation).
#![no_std]
#![no_main]

use core::ptr::addr_of_mut;

use cortex_m_rt::entry;
use panic_halt as _;

use rk0::Kernel;

/// Idle (prio 4) + post-processing (prio 0) + T1/T2/T3 (prio 1/2/3).
const NPRIO: usize = 5;
/// Idle, post-proc, T1, T2, T3.
const NTASKS: usize = 5;

/// Core clock assumed for this demo board; a real board crate would read
/// this from its clock-tree configuration instead of hardcoding it.
const CORE_CLOCK_HZ: u32 = 16_000_000;
/// 1 kHz tick, matching `spec.md` §6 "systick div" semantics.
const TICK_HZ: u32 = 1_000;

static mut KERNEL: Kernel<ArmM, NTASKS, NPRIO> = Kernel::new();

rk0_port_arm_m::use_port!(unsafe struct ArmM => KERNEL);

fn kernel() -> &'static mut Kernel<ArmM, NTASKS, NPRIO> {
    // Safety: single core, and every access happens either before the
    // scheduler starts or from within the kernel's own critical section.
    unsafe { &mut *addr_of_mut!(KERNEL) }
}

fn tick_trampoline() -> bool {
    kernel().tick()
}

static mut IDLE_STACK: [usize; 64] = [0; 64];
static mut POSTPROC_STACK: [usize; 128] = [0; 128];
static mut T1_STACK: [usize; 128] = [0; 128];
static mut T2_STACK: [usize; 128] = [0; 128];
static mut T3_STACK: [usize; 128] = [0; 128];

#[entry]
fn main() -> ! {
    let k = kernel();

    // Safety: these statics are each handed to exactly one task below and
    // never touched again from `main`.
    let idle_stack: &'static mut [usize] = unsafe { &mut *addr_of_mut!(IDLE_STACK) };
    let postproc_stack: &'static mut [usize] = unsafe { &mut *addr_of_mut!(POSTPROC_STACK) };
    let t1_stack: &'static mut [usize] = unsafe { &mut *addr_of_mut!(T1_STACK) };
    let t2_stack: &'static mut [usize] = unsafe { &mut *addr_of_mut!(T2_STACK) };
    let t3_stack: &'static mut [usize] = unsafe { &mut *addr_of_mut!(T3_STACK) };

    k.init_system_tasks(
        rk0::idle::idle_entry::<ArmM>,
        core::ptr::null_mut(),
        idle_stack,
        rk0::postproc::postproc_entry::<ArmM, NTASKS, NPRIO>,
        k as *mut Kernel<ArmM, NTASKS, NPRIO> as *mut (),
        postproc_stack,
    )
    .expect("rk0: system tasks already created");

    k.create_task(t1_body, core::ptr::null_mut(), "T1", t1_stack, 1, true)
        .expect("rk0: failed to create T1");
    k.create_task(t2_body, core::ptr::null_mut(), "T2", t2_stack, 2, true)
        .expect("rk0: failed to create T2");
    k.create_task(t3_body, core::ptr::null_mut(), "T3", t3_stack, 3, true)
        .expect("rk0: failed to create T3");

    let reload = CORE_CLOCK_HZ / TICK_HZ - 1;
    ArmM::program_systick(reload, tick_trampoline);

    k.start()
}

unsafe extern "C" fn t1_body(_arg: *mut ()) {
    loop {
        let _ = kernel().sleep(10);
    }
}

unsafe extern "C" fn t2_body(_arg: *mut ()) {
    loop {
        let _ = kernel().sleep(10);
    }
}

unsafe extern "C" fn t3_body(_arg: *mut ()) {
    loop {
        let _ = kernel().sleep(10);
    }
}
