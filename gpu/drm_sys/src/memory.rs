// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CPU view of buffer object backing storage.

use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The CPU-visible backing store of a buffer object.
///
/// Storage is accessed as little-endian 64-bit atomic words so the host and
/// a device (or a device simulator) can update counters concurrently without
/// tearing. Narrower accesses are performed on the containing word.
pub struct BoMemory {
    backing: Backing,
}

enum Backing {
    Heap(Box<[AtomicU64]>),
    Mapped { base: NonNull<AtomicU64>, words: usize },
}

// SAFETY: the mapped region is only accessed through atomics and is owned by
// this object until drop.
unsafe impl Send for Backing {}
// SAFETY: see above.
unsafe impl Sync for Backing {}

impl std::fmt::Debug for BoMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoMemory")
            .field("len", &self.len())
            .field("mapped", &matches!(self.backing, Backing::Mapped { .. }))
            .finish()
    }
}

impl BoMemory {
    /// Allocates zeroed host memory of at least `len` bytes.
    pub fn new_heap(len: usize) -> Self {
        let words = len.div_ceil(8);
        Self {
            backing: Backing::Heap((0..words).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    /// Wraps a shared mapping created by `mmap`.
    ///
    /// # Safety
    /// `base` must point to a live, 8-byte aligned, read/write mapping of
    /// `len` bytes that is exclusively owned by the returned object. It is
    /// unmapped on drop.
    pub unsafe fn from_mapping(base: NonNull<u8>, len: usize) -> Self {
        Self {
            backing: Backing::Mapped {
                base: base.cast(),
                words: len / 8,
            },
        }
    }

    fn words(&self) -> &[AtomicU64] {
        match &self.backing {
            Backing::Heap(words) => words,
            // SAFETY: the mapping is valid for `words` elements per the
            // contract of `from_mapping`.
            Backing::Mapped { base, words } => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), *words)
            },
        }
    }

    /// The size of the storage in bytes.
    pub fn len(&self) -> usize {
        self.words().len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        &self.words()[offset / 8]
    }

    /// Reads the 64-bit value at `offset`, which must be 8-byte aligned.
    ///
    /// Panics if `offset` is out of bounds.
    pub fn read_u64(&self, offset: usize) -> u64 {
        debug_assert_eq!(offset % 8, 0);
        self.word(offset).load(Ordering::Acquire)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        debug_assert_eq!(offset % 8, 0);
        self.word(offset).store(value, Ordering::Release);
    }

    pub fn fetch_add_u64(&self, offset: usize, value: u64) -> u64 {
        debug_assert_eq!(offset % 8, 0);
        self.word(offset).fetch_add(value, Ordering::AcqRel)
    }

    /// Reads the 32-bit value at `offset`, which must be 4-byte aligned.
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        let shift = (offset % 8) * 8;
        (self.word(offset).load(Ordering::Acquire) >> shift) as u32
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        debug_assert_eq!(offset % 4, 0);
        let shift = (offset % 8) * 8;
        let mask = !(0xffff_ffffu64 << shift);
        let _ = self
            .word(offset)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & mask) | ((value as u64) << shift))
            });
    }

    pub fn fetch_add_u32(&self, offset: usize, value: u32) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        let shift = (offset % 8) * 8;
        let mask = !(0xffff_ffffu64 << shift);
        let old = self
            .word(offset)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                let current = (old >> shift) as u32;
                Some((old & mask) | ((current.wrapping_add(value) as u64) << shift))
            })
            .unwrap_or_else(|old| old);
        (old >> shift) as u32
    }

    /// Copies `data` into the storage starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let addr = offset + i;
            let shift = (addr % 8) * 8;
            let mask = !(0xffu64 << shift);
            let _ = self
                .word(addr)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                    Some((old & mask) | ((b as u64) << shift))
                });
        }
    }

    /// Copies from the storage starting at `offset` into `data`.
    pub fn read_bytes(&self, offset: usize, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            let addr = offset + i;
            *b = (self.word(addr).load(Ordering::Acquire) >> ((addr % 8) * 8)) as u8;
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Mapped { base, words } = self {
            // SAFETY: the mapping is owned by this object and no references
            // to it outlive `self`.
            let r = unsafe { libc::munmap(base.as_ptr().cast(), *words * 8) };
            if r != 0 {
                tracing::error!(
                    error = &std::io::Error::last_os_error() as &dyn std::error::Error,
                    "failed to unmap buffer object"
                );
            }
        }
    }
}
