//! Byte-level access to the shared ring memory.
//!
//! The ring is owned by the kernel and written concurrently with our reads, so
//! nothing in this crate ever forms a `&[u8]` or a typed reference over it.
//! Every access goes through [`Region`], which reads fixed offsets with
//! volatile loads and decodes little-endian values explicitly.
//!
//! The mapping is writable at the OS level, but the consumer protocol only
//! permits one write: the header's tail field. `Region` therefore exposes no
//! public write accessor; the tail store is crate-private and reachable only
//! through the acknowledge path.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, Ordering};

/// A view over a mapped byte range.
///
/// `Region` does not own its memory; it borrows whoever handed it out (a
/// [`DeviceMapping`](crate::DeviceMapping), a [`HeapRegion`]) for `'a`, so
/// it cannot outlive the mapping.
///
/// ```compile_fail
/// use zlog_ring::HeapRegion;
///
/// let region = {
///     let heap = HeapRegion::new_zeroed(16);
///     heap.region()
/// };
/// region.read_u8(0);
/// ```
///
/// Closing a session ends every region borrowed from its device:
///
/// ```compile_fail
/// use zlog_ring::{RingDevice, RingSession};
///
/// let mut session = RingSession::open("/proc/zlog", 16)?;
/// let region = session.device()?.region();
/// session.close();
/// region.read_u8(0);
/// # Ok::<(), zlog_ring::SessionError>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _owner: PhantomData<&'a ()>,
}

// SAFETY: Region is a pointer + length into shared memory. All accesses are
// volatile or atomic, never through references.
unsafe impl Send for Region<'_> {}
unsafe impl Sync for Region<'_> {}

impl<'a> Region<'a> {
    /// Create a region from a raw base pointer.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for all of
    /// `'a`, and must be at least 2-byte aligned.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        assert!(
            (base.as_ptr() as usize).is_multiple_of(2),
            "region base must be 2-byte aligned"
        );
        Self {
            base,
            len,
            _owner: PhantomData,
        }
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        let end = offset.checked_add(width);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "read of {width} bytes at offset {offset} exceeds region of {} bytes",
            self.len
        );
    }

    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        self.check(offset, N);
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: bounds checked above; base is valid for `len` bytes.
            *byte = unsafe { ptr::read_volatile(self.base.as_ptr().add(offset + i)) };
        }
        out
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    pub fn read_u16_le(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    pub fn read_u32_le(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    ///
    /// Panics if the range is not inside the region.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked above.
            *byte = unsafe { ptr::read_volatile(self.base.as_ptr().add(offset + i)) };
        }
    }

    /// Publish a little-endian u16 with release ordering.
    ///
    /// This is the only store the consumer makes into kernel memory.
    pub(crate) fn store_u16_le(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        assert!(offset.is_multiple_of(2), "u16 store must be aligned");
        // SAFETY: in bounds, 2-byte aligned (base is 2-aligned, offset even),
        // and the field is only ever accessed atomically or via volatile reads.
        let cell = unsafe { AtomicU16::from_ptr(self.base.as_ptr().add(offset).cast::<u16>()) };
        cell.store(value.to_le(), Ordering::Release);
    }

    /// Raw byte store, used by the in-process ring simulator to play the
    /// kernel's part.
    pub(crate) fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { ptr::write_volatile(self.base.as_ptr().add(offset + i), *byte) };
        }
    }
}

/// Heap-backed, 8-byte aligned, zero-initialised memory that can be viewed as
/// a [`Region`].
///
/// Used where no device is mapped: the ring simulator and unit tests.
pub struct HeapRegion {
    words: NonNull<u64>,
    word_count: usize,
    len: usize,
}

// SAFETY: HeapRegion owns its allocation; shared access goes through Region.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new_zeroed(len: usize) -> Self {
        let word_count = len.div_ceil(8);
        let boxed: Box<[u64]> = vec![0u64; word_count].into_boxed_slice();
        let raw = Box::into_raw(boxed).cast::<u64>();
        // SAFETY: Box::into_raw never returns null.
        let words = unsafe { NonNull::new_unchecked(raw) };
        Self {
            words,
            word_count,
            len,
        }
    }

    pub fn region(&self) -> Region<'_> {
        // SAFETY: the allocation lives as long as the borrow of self and is 8-byte aligned.
        unsafe { Region::from_raw(self.words.cast::<u8>(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: reconstructs the exact boxed slice created in new_zeroed.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.words.as_ptr(),
                self.word_count,
            )));
        }
    }
}
