//! C2: fixed-block memory pool (`spec.md` §4.13).
//!
//! Grounded on `original_source/core/src/kmem.c`: blocks are threaded into a
//! singly-linked free list by writing the address of the next free block
//! into the first word of each free block. `kMemAlloc` pops the head;
//! `kMemFree` pushes the freed block back on, with the same
//! `nFreeBlocks == nMaxBlocks` double-free guard the original uses.
//!
//! The backing storage is an owned, fixed-size, word array (`N_BLOCKS *
//! STRIDE` words, `STRIDE` being `BLK_SIZE` rounded up to a whole number of
//! words) rather than a caller-supplied pointer, since Rust has no
//! equivalent to handing the kernel a raw `VOID *` into memory of unstated
//! provenance; the free-list linkage itself is still implemented with raw
//! pointers into that array, matching the original's in-place threading.
//! Using a `usize` element type (rather than `u8`) keeps the array's base
//! address, and therefore every block's address, pointer-aligned.
use core::mem::size_of;
use core::ptr;

use crate::error::{Error, Result};

const MIN_BLOCK: usize = size_of::<*mut u8>();
/// Word size the free-list threading writes (`(blk as *mut *mut u8)`);
/// every block's address must be a multiple of this or those writes are
/// misaligned — UB on the host, a HardFault on ARMv6-M/v7-M (`spec.md`
/// §1/§3).
const WORD: usize = size_of::<usize>();

const fn round_up_to_word(n: usize) -> usize {
    (n + WORD - 1) / WORD * WORD
}

/// A fixed-block partition of `N_BLOCKS` blocks, each `BLK_SIZE` bytes
/// (rounded up to a pointer-aligned size by construction).
pub struct MemPartition<const BLK_SIZE: usize, const N_BLOCKS: usize> {
    /// Backing storage as `usize` words rather than `u8` so the array is
    /// naturally pointer-aligned — the free-list threading below writes a
    /// `*mut u8` into the first word of each block.
    storage: [usize; Self::STRIDE_WORDS_TIMES_N],
    free_list: Option<*mut u8>,
    n_free: usize,
    init: bool,
}

impl<const BLK_SIZE: usize, const N_BLOCKS: usize> MemPartition<BLK_SIZE, N_BLOCKS> {
    const STRIDE: usize = round_up_to_word(if BLK_SIZE >= MIN_BLOCK { BLK_SIZE } else { MIN_BLOCK });
    const STRIDE_WORDS: usize = Self::STRIDE / WORD;
    const STRIDE_WORDS_TIMES_N: usize = Self::STRIDE_WORDS * N_BLOCKS;

    /// Build an uninitialized partition. Call [`Self::init`] before any
    /// alloc/free, matching `kMemInit` being a distinct step from
    /// declaration in the original.
    pub const fn new() -> Self {
        Self {
            storage: [0usize; Self::STRIDE_WORDS_TIMES_N],
            free_list: None,
            n_free: 0,
            init: false,
        }
    }

    /// Thread every block into the free list. `Error::ObjectDoubleInit` if
    /// called twice.
    pub fn init(&mut self) -> Result<()> {
        if self.init {
            return Err(Error::ObjectDoubleInit);
        }
        let base = self.storage.as_mut_ptr() as *mut u8;
        for i in 0..N_BLOCKS {
            // Safety: `i < N_BLOCKS`, each block is `Self::STRIDE` bytes and
            // at least pointer-sized, within `self.storage`.
            unsafe {
                let blk = base.add(i * Self::STRIDE);
                let next = if i + 1 < N_BLOCKS {
                    base.add((i + 1) * Self::STRIDE)
                } else {
                    ptr::null_mut()
                };
                (blk as *mut *mut u8).write(next);
            }
        }
        self.free_list = if N_BLOCKS == 0 {
            None
        } else {
            Some(base)
        };
        self.n_free = N_BLOCKS;
        self.init = true;
        Ok(())
    }

    pub fn blocks_free(&self) -> usize {
        self.n_free
    }

    pub fn block_size(&self) -> usize {
        BLK_SIZE
    }

    /// Pop the head of the free list. Returns `None` when exhausted,
    /// matching `kMemAlloc` returning `NULL` rather than blocking — this
    /// primitive never suspends the caller.
    pub fn alloc(&mut self) -> Option<*mut u8> {
        let head = self.free_list?;
        // Safety: `head` was written by `init` or a prior `free` as a valid
        // block address within `self.storage`.
        let next = unsafe { (head as *mut *mut u8).read() };
        self.free_list = if next.is_null() { None } else { Some(next) };
        self.n_free -= 1;
        Some(head)
    }

    /// Push `block` back onto the free list.
    ///
    /// # Safety
    /// `block` must be a pointer previously returned by [`Self::alloc`] on
    /// this same partition, not already freed.
    pub unsafe fn free(&mut self, block: *mut u8) -> Result<()> {
        if self.n_free == N_BLOCKS {
            return Err(Error::MemDoubleFree);
        }
        let next = match self.free_list {
            Some(p) => p,
            None => ptr::null_mut(),
        };
        unsafe { (block as *mut *mut u8).write(next) };
        self.free_list = Some(block);
        self.n_free += 1;
        Ok(())
    }
}

impl<const BLK_SIZE: usize, const N_BLOCKS: usize> Default for MemPartition<BLK_SIZE, N_BLOCKS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_and_free_replenishes() {
        let mut pool: MemPartition<16, 4> = MemPartition::new();
        pool.init().unwrap();
        assert_eq!(pool.blocks_free(), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        let d = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.blocks_free(), 0);

        unsafe {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
            pool.free(c).unwrap();
            pool.free(d).unwrap();
        }
        assert_eq!(pool.blocks_free(), 4);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn double_init_is_rejected() {
        let mut pool: MemPartition<8, 2> = MemPartition::new();
        pool.init().unwrap();
        assert_eq!(pool.init(), Err(Error::ObjectDoubleInit));
    }

    #[test]
    fn odd_block_size_stays_word_aligned() {
        // `BLK_SIZE = 5` used to make block i land at `5*i`, misaligned for
        // the in-place `*mut *mut u8` free-list writes.
        let mut pool: MemPartition<5, 4> = MemPartition::new();
        pool.init().unwrap();
        let blocks: [*mut u8; 4] = core::array::from_fn(|_| pool.alloc().unwrap());
        for b in blocks {
            assert_eq!((b as usize) % WORD, 0);
        }
        unsafe {
            for b in blocks {
                pool.free(b).unwrap();
            }
        }
    }
}
