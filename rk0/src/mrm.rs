//! C13: MRM (most-recent-message) publish/subscribe buffers (`spec.md`
//! §4.14).
//!
//! Grounded on `original_source/core/src/kmrm.c`. An MRM lets a writer
//! publish a new message generation without blocking on readers still
//! holding an older one, and lets readers each hold their own generation
//! without blocking each other or the writer: [`MrmCb::reserve`] hands out a
//! spare slot, [`MrmCb::publish`] fills it and makes it current,
//! [`MrmCb::get`] copies out whatever is current and marks the caller as a
//! reader of it, [`MrmCb::unget`] releases that hold.
//!
//! The original backs this with two `kMemPartition`s — one for the
//! `RK_MRM_BUF` headers, one for the raw data blocks — since a C
//! `kMemPartition` is its only allocator primitive. This crate keeps
//! [`crate::pool::MemPartition`] for the data blocks but tracks headers as a
//! plain fixed array: `N_BUFS` is a compile-time constant here, so there is
//! no provenance reason to pool the headers too. Buffer sizes are expressed
//! in bytes (`BUF_BYTES`), matching `MemPartition`'s own unit, rather than
//! words like the original's `dataSizeWords`.
use rk0_port::Port;

use crate::error::{Error, Result};
use crate::klock::{self, CpuLockCell};
use crate::obj::ObjectKind;
use crate::pool::MemPartition;

struct BufHeader {
    in_use: bool,
    data: *mut u8,
    n_users: u32,
}

impl BufHeader {
    const fn empty() -> Self {
        Self {
            in_use: false,
            data: core::ptr::null_mut(),
            n_users: 0,
        }
    }
}

struct MrmState<const N_BUFS: usize, const BUF_BYTES: usize> {
    init: bool,
    kind: ObjectKind,
    data_pool: MemPartition<BUF_BYTES, N_BUFS>,
    headers: [BufHeader; N_BUFS],
    curr: Option<usize>,
    /// `kMRMMem`'s `failReserve`: counts reservations that found the pool
    /// exhausted, for diagnostics — never consulted by the kernel itself.
    fail_reserve: u32,
}

impl<const N_BUFS: usize, const BUF_BYTES: usize> MrmState<N_BUFS, BUF_BYTES> {
    const fn new() -> Self {
        Self {
            init: false,
            kind: ObjectKind::Mrm,
            data_pool: MemPartition::new(),
            headers: [const { BufHeader::empty() }; N_BUFS],
            curr: None,
            fail_reserve: 0,
        }
    }
}

/// An MRM buffer holding up to `N_BUFS` in-flight generations of a
/// `BUF_BYTES`-byte message. Declared `'static` by the application, e.g.
/// `static SENSOR_FEED: MrmCb<MyPort, 3, 16> = MrmCb::new();`.
pub struct MrmCb<P: Port, const N_BUFS: usize, const BUF_BYTES: usize> {
    inner: CpuLockCell<P, MrmState<N_BUFS, BUF_BYTES>>,
}

// Safety: all access to `inner` goes through `CpuLockCell`, which requires a
// live `CpuLockToken<P>`.
unsafe impl<P: Port, const N_BUFS: usize, const BUF_BYTES: usize> Sync for MrmCb<P, N_BUFS, BUF_BYTES> {}

impl<P: Port, const N_BUFS: usize, const BUF_BYTES: usize> MrmCb<P, N_BUFS, BUF_BYTES> {
    pub const fn new() -> Self {
        Self {
            inner: CpuLockCell::new(MrmState::new()),
        }
    }

    pub fn init(&self) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        if st.init {
            return Err(Error::ObjectDoubleInit);
        }
        st.data_pool.init()?;
        st.init = true;
        Ok(())
    }

    fn check_init(st: &MrmState<N_BUFS, BUF_BYTES>) -> Result<()> {
        if !st.init {
            return Err(Error::ObjectNotInit);
        }
        if st.kind != ObjectKind::Mrm {
            return Err(Error::InvalidObject);
        }
        Ok(())
    }

    /// `kMRMReserve`: obtain a slot to publish into. If the current
    /// generation has no readers left it is reused in place (zeroed by the
    /// subsequent [`Self::publish`]'s overwrite); otherwise a fresh slot is
    /// allocated from the data pool. `Error::MemPoolExhausted` if none is
    /// free.
    pub fn reserve(&self) -> Result<usize> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        Self::check_init(st)?;

        if let Some(c) = st.curr {
            if st.headers[c].n_users == 0 {
                return Ok(c);
            }
        }

        let Some(slot) = st.headers.iter().position(|h| !h.in_use) else {
            st.fail_reserve += 1;
            return Err(Error::MemPoolExhausted);
        };
        let Some(data) = st.data_pool.alloc() else {
            st.fail_reserve += 1;
            return Err(Error::MemPoolExhausted);
        };
        st.headers[slot] = BufHeader {
            in_use: true,
            data,
            n_users: 0,
        };
        Ok(slot)
    }

    /// `kMRMPublish`: copy `msg` into `slot` (as returned by [`Self::reserve`])
    /// and make it the current generation.
    pub fn publish(&self, slot: usize, msg: &[u8]) -> Result<()> {
        if msg.len() != BUF_BYTES {
            return Err(Error::InvalidParam);
        }
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        Self::check_init(st)?;
        let hdr = st.headers.get(slot).ok_or(Error::InvalidParam)?;
        if !hdr.in_use {
            return Err(Error::InvalidParam);
        }
        let dst = hdr.data;
        // Safety: `dst` came from `data_pool.alloc()`, sized `BUF_BYTES`,
        // and `msg.len() == BUF_BYTES` was just checked.
        unsafe { core::ptr::copy_nonoverlapping(msg.as_ptr(), dst, BUF_BYTES) };
        st.curr = Some(slot);
        Ok(())
    }

    /// `kMRMGet`: copy out the current generation and record a new reader on
    /// it. Returns the slot handle to later pass to [`Self::unget`].
    /// `Error::QueueEmpty` if nothing has been published yet.
    pub fn get(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() != BUF_BYTES {
            return Err(Error::InvalidParam);
        }
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        Self::check_init(st)?;
        let Some(c) = st.curr else {
            return Err(Error::QueueEmpty);
        };
        st.headers[c].n_users += 1;
        let src = st.headers[c].data;
        // Safety: see `publish`.
        unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), BUF_BYTES) };
        Ok(c)
    }

    /// `kMRMUnget`: release a reader's hold on `slot`. The slot returns to
    /// the data pool once no reader remains and it is not the current
    /// generation — a still-current slot stays reserved for the next
    /// [`Self::get`] even with zero readers.
    pub fn unget(&self, slot: usize) -> Result<()> {
        let mut guard = klock::lock::<P>().expect("rk0: reentrant kernel lock");
        let mut token = guard.borrow_mut();
        let st = self.inner.get_mut(&mut token);
        Self::check_init(st)?;
        let hdr = st.headers.get_mut(slot).ok_or(Error::InvalidParam)?;
        if !hdr.in_use {
            return Err(Error::InvalidParam);
        }
        if hdr.n_users > 0 {
            hdr.n_users -= 1;
        }
        if hdr.n_users == 0 && st.curr != Some(slot) {
            let data = hdr.data;
            hdr.in_use = false;
            hdr.data = core::ptr::null_mut();
            // Safety: `data` came from this same `data_pool.alloc()` and is
            // only ever freed once, guarded by `in_use`.
            unsafe { st.data_pool.free(data)? };
        }
        Ok(())
    }
}

impl<P: Port, const N_BUFS: usize, const BUF_BYTES: usize> Default for MrmCb<P, N_BUFS, BUF_BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn get_before_any_publish_is_empty() {
        static MRM: MrmCb<HostPort, 2, 4> = MrmCb::new();
        MRM.init().unwrap();
        let mut out = [0u8; 4];
        assert_eq!(MRM.get(&mut out), Err(Error::QueueEmpty));
    }

    #[test]
    fn publish_then_get_round_trips() {
        static MRM: MrmCb<HostPort, 2, 4> = MrmCb::new();
        MRM.init().unwrap();

        let slot = MRM.reserve().unwrap();
        MRM.publish(slot, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        let got = MRM.get(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        MRM.unget(got).unwrap();
    }

    #[test]
    fn reader_holding_a_generation_does_not_block_a_new_publish() {
        static MRM: MrmCb<HostPort, 2, 4> = MrmCb::new();
        MRM.init().unwrap();

        let slot_a = MRM.reserve().unwrap();
        MRM.publish(slot_a, &[1, 1, 1, 1]).unwrap();
        let mut out = [0u8; 4];
        let reader_slot = MRM.get(&mut out).unwrap();

        // a reader is still holding `slot_a`, so reserve must hand out a
        // different slot rather than reuse it underneath the reader.
        let slot_b = MRM.reserve().unwrap();
        assert_ne!(slot_a, slot_b);
        MRM.publish(slot_b, &[2, 2, 2, 2]).unwrap();

        let mut latest = [0u8; 4];
        let latest_slot = MRM.get(&mut latest).unwrap();
        assert_eq!(latest, [2, 2, 2, 2]);

        MRM.unget(reader_slot).unwrap();
        MRM.unget(latest_slot).unwrap();
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        static MRM: MrmCb<HostPort, 1, 4> = MrmCb::new();
        MRM.init().unwrap();

        let slot_a = MRM.reserve().unwrap();
        MRM.publish(slot_a, &[9, 9, 9, 9]).unwrap();
        let mut out = [0u8; 4];
        let _reader = MRM.get(&mut out).unwrap();

        // the single slot is both current and held by a reader, so a second
        // reserve has nowhere left to go.
        assert_eq!(MRM.reserve(), Err(Error::MemPoolExhausted));
    }
}
