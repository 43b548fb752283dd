/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Page-aligned buffer management.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::error::{EngineError, EngineResult};

/// Alignment used when the OS page size cannot be queried.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The OS page size, used as the buffer alignment.
///
/// Direct I/O requires the transfer buffer to be aligned to the device's
/// logical block size; page alignment satisfies every device this engine is
/// expected to run against.
pub(crate) fn os_page_size() -> usize {
    // SAFETY: sysconf only reads kernel-provided constants.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// An owned, page-aligned, zero-initialized buffer of exactly one block.
///
/// The engine allocates one of these per channel slot, and hands them to
/// callers on read completion and through
/// [`IoEngine::write_buffer`](crate::engine::IoEngine::write_buffer). The
/// buffer dereferences to `[u8]`; the allocation is freed on drop.
pub struct PageBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: `PageBuffer` uniquely owns its allocation; the raw pointer is never
// shared outside the struct except while the kernel fills the buffer, which
// only happens under the engine lock before ownership is handed over.
unsafe impl Send for PageBuffer {}
// SAFETY: shared access only reads the owned allocation; all mutation goes
// through `&mut self`.
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    /// Allocate a zeroed buffer of `len` bytes, aligned to the OS page size.
    pub fn new(len: usize) -> EngineResult<Self> {
        let align = os_page_size();
        if len == 0 {
            return Err(EngineError::Allocation { size: len, align });
        }

        let layout = Layout::from_size_align(len, align)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(EngineError::Allocation {
            size: len,
            align: layout.align(),
        })?;

        Ok(Self { ptr, layout })
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Whether the buffer is empty. Buffers produced by this crate never are.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the pointer covers exactly `layout.size()` initialized
        // bytes owned by this struct.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: same bounds as `deref`; `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuffer")
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_send_and_sync() {
        fn assert_send_and_sync<T: Send + Sync>() {}
        assert_send_and_sync::<PageBuffer>();
    }

    #[test]
    fn allocates_zeroed_at_requested_length() {
        let buf = PageBuffer::new(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(!buf.is_empty());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocation_is_page_aligned() {
        let align = os_page_size();
        for len in [512, 4096, 512 * 17] {
            let buf = PageBuffer::new(len).unwrap();
            assert_eq!(buf.as_ptr() as usize % align, 0);
            assert_eq!(buf.len(), len);
        }
    }

    #[test]
    fn rejects_empty_allocation() {
        let err = PageBuffer::new(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
    }

    #[test]
    fn contents_are_writable_through_deref() {
        let mut buf = PageBuffer::new(512).unwrap();
        buf.fill(0xAB);
        assert!(buf.iter().all(|&b| b == 0xAB));
        buf[0] = 0x01;
        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[1], 0xAB);
    }

    #[test]
    fn os_page_size_is_a_power_of_two() {
        let size = os_page_size();
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }
}
