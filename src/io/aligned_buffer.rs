//! Block-aligned buffers for direct IO

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::error::{IoError, IoResult};
use super::scheduler::config::BLOCK_SIZE;

/// Alignment (and allocation granularity) of every buffer
pub const BUFFER_ALIGN: usize = BLOCK_SIZE as usize;

/// A buffer aligned to `BUFFER_ALIGN` for direct IO operations
///
/// The allocation never moves, so a raw pointer to it stays valid while the
/// kernel owns an operation that targets it, even if the `AlignedBuffer`
/// value itself is moved.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// Safety: AlignedBuffer owns its data and can be sent between threads
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a new zeroed buffer with the given capacity
    ///
    /// Capacity is rounded up to the nearest `BUFFER_ALIGN` multiple.
    pub fn new(capacity: usize) -> IoResult<Self> {
        let capacity = Self::round_up(capacity);
        if capacity == 0 {
            return Err(IoError::BufferSize {
                size: 0,
                alignment: BUFFER_ALIGN,
            });
        }

        let layout =
            Layout::from_size_align(capacity, BUFFER_ALIGN).map_err(|_| IoError::Alignment {
                expected: BUFFER_ALIGN,
                actual: 0,
            })?;

        // Safety: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            IoError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "Failed to allocate aligned buffer",
            ))
        })?;

        Ok(Self {
            ptr,
            len: 0,
            capacity,
        })
    }

    /// Create a buffer spanning exactly one block
    pub fn block() -> IoResult<Self> {
        Self::new(BUFFER_ALIGN)
    }

    /// Create a buffer filled with `data`
    pub fn from_slice(data: &[u8]) -> IoResult<Self> {
        let mut buf = Self::new(data.len().max(1))?;
        buf.copy_from_slice(data)?;
        Ok(buf)
    }

    /// Round up a size to the nearest `BUFFER_ALIGN` multiple
    #[inline]
    pub fn round_up(size: usize) -> usize {
        (size + BUFFER_ALIGN - 1) & !(BUFFER_ALIGN - 1)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the valid data
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the buffer's length
    ///
    /// # Panics
    /// Panics if len > capacity
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity, "len exceeds capacity");
        self.len = len;
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the buffer as a slice (up to len)
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for len bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice (up to capacity)
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for capacity bytes
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Copy data into the buffer, setting len to `data.len()`
    pub fn copy_from_slice(&mut self, data: &[u8]) -> IoResult<()> {
        if data.len() > self.capacity {
            return Err(IoError::RequestTooLarge {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        // Safety: both pointers are valid and don't overlap
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safety: ptr was allocated with exactly this size and alignment,
        // which were validated by `Layout::from_size_align` in `new`
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, BUFFER_ALIGN);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for len bytes
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let buf = AlignedBuffer::new(100).unwrap();
        assert!((buf.as_ptr() as usize).is_multiple_of(BUFFER_ALIGN));
        assert_eq!(buf.capacity(), BUFFER_ALIGN);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(AlignedBuffer::round_up(0), 0);
        assert_eq!(AlignedBuffer::round_up(1), BUFFER_ALIGN);
        assert_eq!(AlignedBuffer::round_up(BUFFER_ALIGN), BUFFER_ALIGN);
        assert_eq!(AlignedBuffer::round_up(BUFFER_ALIGN + 1), BUFFER_ALIGN * 2);
    }

    #[test]
    fn test_from_slice_too_large() {
        let mut buf = AlignedBuffer::block().unwrap();
        let big = vec![7u8; BUFFER_ALIGN + 1];
        assert!(matches!(
            buf.copy_from_slice(&big),
            Err(IoError::RequestTooLarge { .. })
        ));

        let small = AlignedBuffer::from_slice(b"block").unwrap();
        assert_eq!(&small[..], b"block");
    }
}
