//! RK0: a preemptive, priority-based real-time microkernel for ARMv6-M and
//! ARMv7-M targets.
//!
//! This crate is the portable kernel core: the scheduler, task lifecycle,
//! time subsystem, and synchronization/IPC primitives. It is generic over a
//! [`rk0_port::Port`] supplied by a CPU-specific port crate (e.g.
//! `rk0-port-arm-m`) and carries no knowledge of any particular board,
//! linker script, or application.
#![no_std]
#![allow(clippy::too_many_arguments)]

#[cfg(test)]
extern crate std;

pub mod bitmap;
pub mod error;
pub mod event;
pub mod fault;
pub mod idle;
pub mod kernel;
pub mod klock;
pub mod list;
#[cfg(feature = "mesg_queue")]
pub mod mesgq;
#[cfg(feature = "mrm")]
pub mod mrm;
#[cfg(feature = "mutex")]
pub mod mutex;
pub mod obj;
pub mod pool;
pub mod postproc;
pub mod sched;
#[cfg(feature = "semaphore")]
pub mod semaphore;
#[cfg(feature = "sleep_queue")]
pub mod sleepq;
pub mod task;
#[cfg(feature = "callout_timer")]
pub mod timer;
pub mod tick;
pub mod time;
pub mod timeout;

pub use error::{Error, Result};
pub use kernel::Kernel;
pub use rk0_port::Port;
