//! Host backend storage: owned aligned or page-locked allocations, or a
//! wrapped externally-owned region.

use unibuf_alloc::aligned::AlignedAlloc;
use unibuf_alloc::pinned::PinnedAlloc;

use crate::backend::Hints;

/// The physical storage behind a buffer's host backend.
///
/// Owned variants free themselves on drop; the external variant is never
/// freed by the engine.
pub(crate) enum HostStorage {
    Aligned(AlignedAlloc),
    Pinned(PinnedAlloc),
    External {
        ptr: *mut u8,
        len: usize,
        read_only: bool,
    },
}

// Safety: owned variants are uniquely-owned allocations; for the external
// variant, thread transfer is part of the caller's wrap contract.
unsafe impl Send for HostStorage {}

impl HostStorage {
    /// Allocates `len` zeroed host bytes honoring the page-lock hint.
    /// A zero `len` still produces a one-byte allocation so the base
    /// pointer stays usable.
    pub(crate) fn alloc(len: usize, align: usize, hints: Hints) -> std::io::Result<HostStorage> {
        if hints.contains(Hints::PAGE_LOCKED) {
            Ok(HostStorage::Pinned(PinnedAlloc::new(len)?))
        } else {
            Ok(HostStorage::Aligned(AlignedAlloc::new(len, align)?))
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            HostStorage::Aligned(a) => a.len(),
            HostStorage::Pinned(p) => p.len(),
            HostStorage::External { len, .. } => *len,
        }
    }

    pub(crate) fn read_only(&self) -> bool {
        matches!(self, HostStorage::External { read_only: true, .. })
    }

    /// Whether asynchronous device transfers may stream from this storage.
    pub(crate) fn is_page_locked(&self) -> bool {
        matches!(self, HostStorage::Pinned(p) if p.is_locked())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        match self {
            HostStorage::Aligned(a) => a.as_ptr(),
            HostStorage::Pinned(p) => p.as_ptr(),
            HostStorage::External { ptr, .. } => *ptr,
        }
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len() || len == 0);
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(offset), len) }
    }

    pub(crate) fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len() || len == 0);
        debug_assert!(!self.read_only());
        let ptr = match self {
            HostStorage::Aligned(a) => a.as_mut_ptr(),
            HostStorage::Pinned(p) => p.as_mut_ptr(),
            HostStorage::External { ptr, .. } => *ptr,
        };
        unsafe { std::slice::from_raw_parts_mut(ptr.add(offset), len) }
    }
}
