//! Optional fault recording (`spec.md` §7), enabled by the `fault_check`
//! feature. Mirrors the original kernel's `K_ERR_HANDLER`: when a fault-band
//! [`Error`](crate::error::Error) surfaces from the core, a trace item is
//! captured and handed to a user-installed sink before the error is
//! returned to the caller.
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Error;

/// A captured fault: which task was running, roughly where, and why.
#[derive(Debug, Clone, Copy)]
pub struct FaultRecord {
    pub task_name: &'static str,
    pub pid: u8,
    pub tick: u32,
    pub error: Error,
}

type Sink = fn(&FaultRecord);

static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install a callback invoked (from a critical section) whenever a
/// fault-band error is produced. Not reentrant-safe to call concurrently
/// with kernel faults; call it once during `kApplicationInit`.
pub fn set_sink(sink: Sink) {
    SINK.store(sink as *mut (), Ordering::Relaxed);
}

#[cfg(feature = "fault_check")]
pub(crate) fn record(rec: FaultRecord) {
    let ptr = SINK.load(Ordering::Relaxed);
    if !ptr.is_null() {
        // Safety: only ever stored from `set_sink`, which requires `Sink`.
        let sink: Sink = unsafe { core::mem::transmute(ptr) };
        sink(&rec);
    }
}

#[cfg(not(feature = "fault_check"))]
pub(crate) fn record(_rec: FaultRecord) {}
