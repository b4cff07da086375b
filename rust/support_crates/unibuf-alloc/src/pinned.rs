//! Page-locked ("pinned") host allocations.
//!
//! Pinned memory is required for asynchronous DMA transfers: the driver can
//! stream to or from the region without the OS paging it out mid-copy. When
//! the platform cannot lock pages (missing privilege, `RLIMIT_MEMLOCK`, or
//! no OS support) the allocation degrades to a plain page-aligned region and
//! the degradation is reported through [`PinnedAlloc::is_locked`].

use crate::mlock;

/// An owned, page-aligned host allocation whose pages are locked into
/// physical memory when the platform permits it.
pub struct PinnedAlloc {
    ptr: *mut u8,
    len: usize,
    capacity: usize,
    locked: bool,
}

impl PinnedAlloc {
    /// Allocates `len` zeroed bytes of page-aligned memory and attempts to
    /// lock the pages.
    ///
    /// A failed lock is not fatal: the allocation is still returned, with
    /// [`is_locked`](Self::is_locked) reporting `false`, and a warning is
    /// logged once per failure reason.
    pub fn new(len: usize) -> std::io::Result<PinnedAlloc> {
        let (ptr, capacity) = mlock::allocate(len)?;
        let locked = match unsafe { mlock::try_lock(ptr, capacity) } {
            Ok(()) => true,
            Err(err) => {
                log::warn!("page-locking {capacity} bytes failed, using unlocked memory: {err}");
                false
            }
        };
        Ok(PinnedAlloc {
            ptr,
            len,
            capacity,
            locked,
        })
    }

    /// Length of the allocation in bytes, as requested.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the pages are actually locked into physical memory.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The page-size alignment of the base address.
    #[inline]
    pub fn alignment(&self) -> usize {
        mlock::get_page_size()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PinnedAlloc {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                let _ = mlock::unlock(self.ptr, self.capacity);
            }
            let _ = mlock::free(self.ptr, self.capacity);
        }
    }
}

// Uniquely owned mapping; access is serialized by the accessor borrows.
unsafe impl Send for PinnedAlloc {}
unsafe impl Sync for PinnedAlloc {}
