//! Driver-owned DMA memory.
//!
//! Bounce buffers and other device-visible memory come from a
//! [`DmaAllocator`] supplied by the environment. [`HeapAllocator`] is the
//! default: zeroed, aligned heap memory with an upper bound per allocation,
//! suitable for fabric transports and tests.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Default alignment for bounce buffers.
pub const DEFAULT_DMA_ALIGN: usize = 4096;

/// An owned, zero-initialized, aligned buffer.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is plain bytes with a single owner.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `align`.
    pub fn zeroed(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be > 0".to_string()));
        }
        let layout = Layout::from_size_align(size, align.max(1))
            .map_err(|e| Error::InvalidArgument(format!("bad layout: {}", e)))?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Self { ptr, layout })
            .ok_or_else(|| Error::NoMemory(format!("{} byte DMA buffer", size)))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl AsRef<[u8]> for DmaBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

/// Bulk-memory allocator for device-visible buffers.
///
/// Fails with [`Error::NoMemory`] on oversized or exhausted requests.
pub trait DmaAllocator: Send + Sync {
    fn zmalloc(&self, size: usize, align: usize) -> Result<DmaBuffer>;
}

/// Heap-backed allocator with a per-allocation ceiling.
#[derive(Debug, Clone)]
pub struct HeapAllocator {
    max_alloc: usize,
}

impl HeapAllocator {
    pub fn new(max_alloc: usize) -> Self {
        Self { max_alloc }
    }

    pub fn max_alloc(&self) -> usize {
        self.max_alloc
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_DMA_ALLOC)
    }
}

impl DmaAllocator for HeapAllocator {
    fn zmalloc(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        if size > self.max_alloc {
            return Err(Error::NoMemory(format!(
                "{} bytes exceeds allocation limit {}",
                size, self.max_alloc
            )));
        }
        DmaBuffer::zeroed(size, align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_fails() {
        assert!(DmaBuffer::zeroed(0, 0).is_err());
    }

    #[test]
    fn test_zeroed_and_aligned() {
        let buf = DmaBuffer::zeroed(8192, DEFAULT_DMA_ALIGN).unwrap();
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_ptr() as usize % DEFAULT_DMA_ALIGN, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_heap_allocator_limit() {
        let alloc = HeapAllocator::new(4096);
        assert!(alloc.zmalloc(4096, 64).is_ok());
        let err = alloc.zmalloc(4097, 64).unwrap_err();
        assert!(matches!(err, Error::NoMemory(_)));
        assert!(err.is_retryable());
    }
}
