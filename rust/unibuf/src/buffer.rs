//! The coherent multi-backend buffer.
//!
//! A [`Buffer`] is a single logical byte range that may be materialized in
//! up to three physical backends at once: host memory, a rendering-API
//! shared buffer, and accelerator memory. Exactly one backend is the
//! authoritative *owner* at any time; the others hold no copy, a stale
//! copy, or a valid one. Copies are allocated lazily, migrated on demand,
//! and invalidated on write intent.
//!
//! All mutating operations take `&mut self`; callers serialize access per
//! buffer. Asynchronous transfers are issued against an opaque
//! [`QueueToken`] and never awaited here.

use std::sync::atomic::{AtomicU64, Ordering};

use unibuf_common::error::Error;
use unibuf_common::{Result, verify_arg};

use crate::adapter::{BackendEnv, DevicePtr, QueueToken, SharedHandle};
use crate::backend::{Access, Backend, BackendSet, Hints};
use crate::copy::run_bisecting;
use crate::host::HostStorage;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// The accelerator allocation of a buffer: either an independent device
/// allocation or an aliasing map of the shared backend's storage.
#[derive(Clone, Copy)]
struct AccelBlock {
    ptr: DevicePtr,
    aliased: bool,
}

/// A logical byte buffer coherently mirrored across host, shared
/// (rendering-API) and accelerator backends.
pub struct Buffer {
    env: BackendEnv,
    id: u64,
    size: usize,
    align: usize,
    hints: Hints,
    original: Option<Backend>,
    owner: Option<Backend>,
    exists: BackendSet,
    dirty: BackendSet,
    host: Option<HostStorage>,
    shared: Option<SharedHandle>,
    accel: Option<AccelBlock>,
}

impl Buffer {
    /// Creates an empty buffer. No backend is allocated.
    pub fn new(env: BackendEnv) -> Buffer {
        Buffer::with_size_hints(env, 0, Hints::empty(), 1)
    }

    /// Creates a buffer of `size` logical bytes. Allocation is deferred to
    /// the first access.
    pub fn with_size(env: BackendEnv, size: usize) -> Buffer {
        Buffer::with_size_hints(env, size, Hints::empty(), 1)
    }

    /// Creates a buffer with explicit allocation hints and alignment.
    ///
    /// Aliasing is only possible at alignment 1; the hint is stripped
    /// otherwise.
    ///
    /// # Panics
    ///
    /// Panics if `align` is zero or not a power of two.
    pub fn with_size_hints(env: BackendEnv, size: usize, hints: Hints, align: usize) -> Buffer {
        assert!(
            align > 0 && align.is_power_of_two(),
            "alignment must be a power of two"
        );
        let mut hints = hints;
        if align != 1 {
            hints.remove(Hints::ALLOW_ALIASING);
        }
        Buffer {
            env,
            id: next_id(),
            size,
            align,
            hints,
            original: None,
            owner: None,
            exists: BackendSet::empty(),
            dirty: BackendSet::empty(),
            host: None,
            shared: None,
            accel: None,
        }
    }

    /// Creates a buffer holding a copy of `data` in the host backend.
    pub fn from_slice(env: BackendEnv, data: &[u8]) -> Result<Buffer> {
        let mut buf = Buffer::with_size(env, data.len());
        buf.set_range(0, data)?;
        Ok(buf)
    }

    /// Wraps an externally-owned, writable host region. The engine never
    /// frees or resizes the region.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `size` bytes for the
    /// buffer's whole lifetime, and must not be accessed through other
    /// aliases while the buffer is in use. Sending the buffer to another
    /// thread moves that responsibility with it.
    pub unsafe fn wrap_host(env: BackendEnv, ptr: *mut u8, size: usize) -> Result<Buffer> {
        verify_arg!(ptr, !ptr.is_null() || size == 0);
        let mut buf = Buffer::new(env);
        buf.host = Some(HostStorage::External {
            ptr,
            len: size,
            read_only: false,
        });
        buf.finish_wrap(Backend::Host, size);
        Ok(buf)
    }

    /// Wraps an externally-owned, immutable host region. Every operation
    /// with write intent on the resulting buffer fails.
    ///
    /// # Safety
    ///
    /// Same contract as [`wrap_host`](Self::wrap_host), for reads only; the
    /// engine never writes through the pointer.
    pub unsafe fn wrap_host_const(env: BackendEnv, ptr: *const u8, size: usize) -> Result<Buffer> {
        verify_arg!(ptr, !ptr.is_null() || size == 0);
        let mut buf = Buffer::new(env);
        buf.host = Some(HostStorage::External {
            ptr: ptr as *mut u8,
            len: size,
            read_only: true,
        });
        buf.finish_wrap(Backend::Host, size);
        Ok(buf)
    }

    /// Wraps an existing rendering-API shared buffer; its size is queried
    /// from the adapter. The allocation stays owned by its creator.
    pub fn wrap_shared(env: BackendEnv, handle: SharedHandle) -> Result<Buffer> {
        let mut buf = Buffer::new(env);
        let size = buf
            .env
            .shared()
            .size_of(handle)
            .map_err(|e| buf.backend_err(Backend::Shared, "size_of", e))?;
        buf.shared = Some(handle);
        buf.finish_wrap(Backend::Shared, size);
        Ok(buf)
    }

    /// Wraps an existing accelerator allocation of `size` bytes. The
    /// allocation stays owned by its creator.
    pub fn wrap_accel(env: BackendEnv, ptr: DevicePtr, size: usize) -> Result<Buffer> {
        verify_arg!(ptr, ptr.0 != 0 || size == 0);
        let mut buf = Buffer::new(env);
        buf.accel = Some(AccelBlock {
            ptr,
            aliased: false,
        });
        buf.finish_wrap(Backend::Accel, size);
        Ok(buf)
    }

    fn finish_wrap(&mut self, backend: Backend, size: usize) {
        debug_assert!(self.exists.is_empty());
        self.size = size;
        self.align = 1;
        self.original = Some(backend);
        self.owner = Some(backend);
        self.exists = backend.bit();
        self.normalize_hints();
    }

    /// Strips hints the wrapped backend cannot honor.
    fn normalize_hints(&mut self) {
        if self.original == Some(Backend::Host) {
            self.hints.remove(Hints::PAGE_LOCKED);
        }
        if self.original == Some(Backend::Accel) || self.align != 1 {
            self.hints.remove(Hints::ALLOW_ALIASING);
        }
    }
}

impl Buffer {
    /// Logical length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Process-unique identity, included in backend error diagnostics.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn hints(&self) -> Hints {
        self.hints
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// The backend currently holding the authoritative copy, if any
    /// backend has been materialized yet.
    #[inline]
    pub fn owner(&self) -> Option<Backend> {
        self.owner
    }

    /// The wrapped backend this buffer was constructed around, if any.
    #[inline]
    pub fn original(&self) -> Option<Backend> {
        self.original
    }

    /// Backends that currently hold an allocation.
    #[inline]
    pub fn exists(&self) -> BackendSet {
        self.exists
    }

    /// Backends whose copy is stale relative to the owner.
    #[inline]
    pub fn dirty(&self) -> BackendSet {
        self.dirty
    }

    /// Whether the buffer wraps immutable external memory.
    pub fn is_read_only(&self) -> bool {
        self.host.as_ref().is_some_and(|h| h.read_only())
    }

    /// Checks the structural invariants of the coherence state. Intended
    /// for tests and debug assertions.
    ///
    /// # Panics
    ///
    /// Panics if any invariant is violated.
    pub fn check_invariants(&self) {
        if !self.exists.is_empty() {
            let owner = self.owner.expect("owner while a backend exists");
            assert!(self.exists.contains(owner.bit()), "owner must exist");
            assert!(!self.dirty.contains(owner.bit()), "owner must be clean");
        }
        assert!(self.exists.contains(self.dirty), "dirty implies exists");
        if self.hints.contains(Hints::ALLOW_ALIASING) && self.exists.contains(BackendSet::ACCEL) {
            assert!(
                !self.dirty.contains(BackendSet::ACCEL) || self.dirty.contains(BackendSet::SHARED),
                "aliased accel copy cannot be stale independently of shared"
            );
        }
    }

    fn backend_err(&self, backend: Backend, operation: &'static str, source: std::io::Error) -> Error {
        Error::backend(backend.name(), operation, self.id, source)
    }
}

impl Buffer {
    /// Makes `target` the owning backend with the declared access intent,
    /// allocating and validating its copy as needed.
    ///
    /// With [`Access::Write`], every other existing backend is marked
    /// stale. With [`Access::Read`], other copies stay valid.
    pub fn set_owner(&mut self, target: Backend, access: Access) -> Result<()> {
        self.transition(target, access.is_write(), None, self.size)
    }

    /// Like [`set_owner`](Self::set_owner), but only guarantees the first
    /// `preserve` bytes of prior content; the tail is left undefined.
    /// `preserve == 0` declares the whole content irrelevant and skips all
    /// validation copies.
    pub fn set_owner_partial(
        &mut self,
        target: Backend,
        access: Access,
        preserve: usize,
    ) -> Result<()> {
        verify_arg!(preserve, preserve <= self.size);
        self.transition(target, access.is_write(), None, preserve)
    }

    /// Like [`set_owner`](Self::set_owner), issuing device transfers
    /// asynchronously against `queue`. Requires page-locked host memory;
    /// the transfer degrades to synchronous otherwise.
    pub fn set_owner_async(
        &mut self,
        target: Backend,
        access: Access,
        queue: QueueToken,
    ) -> Result<()> {
        self.transition(target, access.is_write(), Some(queue), self.size)
    }

    fn transition(
        &mut self,
        target: Backend,
        modify: bool,
        queue: Option<QueueToken>,
        preserve: usize,
    ) -> Result<()> {
        debug_assert!(preserve <= self.size);
        if modify && self.is_read_only() {
            return Err(Error::invalid_operation(
                "write access to a read-only wrapped buffer",
            ));
        }
        if self.size == 0 {
            // Degenerate buffers never materialize a backend.
            return Ok(());
        }

        // An aliased accelerator view must be torn down before a write
        // lands through another backend, and before a stale shared copy is
        // revalidated underneath it.
        if self.hints.contains(Hints::ALLOW_ALIASING) && self.exists.contains(BackendSet::ACCEL) {
            debug_assert!(!self.dirty.contains(BackendSet::ACCEL));
            if (target != Backend::Accel && modify)
                || (target == Backend::Shared && self.dirty.contains(BackendSet::SHARED))
            {
                self.release_accel("unmap_shared")?;
                // Unmapping publishes writes made through the aliased view,
                // so the shared copy is current again.
                self.dirty.remove(BackendSet::SHARED);
            }
        }

        // Same owner: only the staleness of the other copies changes.
        if self.owner == Some(target) {
            if modify {
                self.dirty = self.exists & !target.bit();
            }
            return Ok(());
        }

        // Asynchronous staging requires page-locked host memory.
        let queue = if self.hints.contains(Hints::PAGE_LOCKED) {
            queue
        } else {
            None
        };

        match target {
            Backend::Host => {
                if !self.exists.contains(BackendSet::HOST) {
                    self.alloc_host()?;
                }
                self.validate_host(queue, preserve)?;
            }
            Backend::Shared | Backend::Accel => {
                let need_shared =
                    target == Backend::Shared || self.hints.contains(Hints::ALLOW_ALIASING);
                if need_shared && !self.exists.contains(BackendSet::SHARED) {
                    // The shared allocation is seeded from the host copy in
                    // the allocation call itself.
                    self.validate_host(None, preserve)?;
                    let seed = self.host.as_ref().map(|h| h.slice(0, self.size));
                    let handle = self
                        .env
                        .shared()
                        .alloc(self.size, seed)
                        .map_err(|e| self.backend_err(Backend::Shared, "alloc", e))?;
                    self.shared = Some(handle);
                    self.exists.insert(BackendSet::SHARED);
                    self.dirty.remove(BackendSet::SHARED);
                } else if target == Backend::Shared && self.dirty.contains(BackendSet::SHARED) {
                    self.validate_host(None, preserve)?;
                    debug_assert!(self.exists.contains(BackendSet::HOST));
                    if preserve > 0 {
                        let handle = self.shared.expect("shared handle");
                        let src = self.host.as_ref().expect("host storage").slice(0, preserve);
                        self.env
                            .shared()
                            .upload(handle, 0, src)
                            .map_err(|e| self.backend_err(Backend::Shared, "upload", e))?;
                    }
                    self.dirty.remove(BackendSet::SHARED);
                }

                if target == Backend::Accel {
                    if !self.exists.contains(BackendSet::ACCEL) {
                        self.alloc_accel()?;
                    }
                    if self.dirty.contains(BackendSet::ACCEL) {
                        self.validate_host(None, preserve)?;
                        if self.exists.contains(BackendSet::HOST) && preserve > 0 {
                            let ptr = self.accel.expect("accel block").ptr;
                            let id = self.id;
                            let env = self.env.clone();
                            let host = self.host.as_ref().expect("host storage");
                            run_bisecting(preserve, "copy_in", |ofs, len| {
                                env.accel()
                                    .copy_in(ptr.offset(ofs), host.slice(ofs, len), queue)
                            })
                            .map_err(|e| Error::backend("accel", "copy_in", id, e))?;
                        }
                        self.dirty.remove(BackendSet::ACCEL);
                    }
                }
            }
        }

        self.owner = Some(target);
        if modify {
            self.dirty = self.exists & !target.bit();
        }
        Ok(())
    }

    /// Brings the host copy up to date for the first `preserve` bytes
    /// without changing the owner. Used as the staging step wherever a
    /// host-addressable view is required.
    fn validate_host(&mut self, queue: Option<QueueToken>, preserve: usize) -> Result<()> {
        if self.exists.contains(BackendSet::HOST) && !self.dirty.contains(BackendSet::HOST) {
            return Ok(());
        }
        self.dirty.remove(BackendSet::HOST);

        // Prefer the shared buffer as the read source, then the accelerator.
        let source = [Backend::Shared, Backend::Accel]
            .into_iter()
            .find(|b| self.exists.contains(b.bit()) && !self.dirty.contains(b.bit()));
        let Some(source) = source else {
            // No valid copy anywhere: fresh buffer, nothing to carry over.
            return Ok(());
        };

        if !self.exists.contains(BackendSet::HOST) {
            self.alloc_host()?;
        }
        if preserve == 0 {
            return Ok(());
        }

        match source {
            Backend::Shared => {
                let handle = self.shared.expect("shared handle");
                let id = self.id;
                let env = self.env.clone();
                let host = self.host.as_mut().expect("host storage");
                env.shared()
                    .download(handle, 0, host.slice_mut(0, preserve))
                    .map_err(|e| Error::backend("shared", "download", id, e))?;
            }
            Backend::Accel => {
                let ptr = self.accel.expect("accel block").ptr;
                let id = self.id;
                let env = self.env.clone();
                let host = self.host.as_mut().expect("host storage");
                let dst = host.slice_mut(0, preserve);
                run_bisecting(preserve, "copy_out", |ofs, len| {
                    env.accel()
                        .copy_out(&mut dst[ofs..ofs + len], ptr.offset(ofs), queue)
                })
                .map_err(|e| Error::backend("accel", "copy_out", id, e))?;
            }
            Backend::Host => unreachable!(),
        }
        Ok(())
    }

    fn alloc_host(&mut self) -> Result<()> {
        debug_assert!(self.host.is_none());
        let storage = HostStorage::alloc(self.size, self.align, self.hints)
            .map_err(|e| self.backend_err(Backend::Host, "alloc", e))?;
        self.host = Some(storage);
        self.exists.insert(BackendSet::HOST);
        Ok(())
    }

    fn alloc_accel(&mut self) -> Result<()> {
        debug_assert!(self.accel.is_none());
        let aliased = self.hints.contains(Hints::ALLOW_ALIASING);
        let ptr = if aliased {
            let handle = self.shared.expect("shared handle");
            self.env
                .accel()
                .map_shared(handle)
                .map_err(|e| self.backend_err(Backend::Accel, "map_shared", e))?
        } else {
            self.env
                .accel()
                .alloc(self.size, self.align)
                .map_err(|e| self.backend_err(Backend::Accel, "alloc", e))?
        };
        self.accel = Some(AccelBlock { ptr, aliased });
        self.exists.insert(BackendSet::ACCEL);
        self.dirty.insert(BackendSet::ACCEL);
        // A fresh aliased mapping already carries the shared content.
        if aliased && !self.dirty.contains(BackendSet::SHARED) {
            self.dirty.remove(BackendSet::ACCEL);
        }
        Ok(())
    }
}

impl Buffer {
    /// Writes `src` at byte `dst_ofs`, targeting whichever backend
    /// currently owns the data. Coherence state does not change beyond the
    /// staleness marking of the other copies.
    pub fn set_range(&mut self, dst_ofs: usize, src: &[u8]) -> Result<()> {
        self.set_range_impl(dst_ofs, src, None)
    }

    /// Asynchronous variant of [`set_range`](Self::set_range); the device
    /// copy, if any, is issued against `queue` without waiting.
    pub fn set_range_async(&mut self, dst_ofs: usize, src: &[u8], queue: QueueToken) -> Result<()> {
        self.set_range_impl(dst_ofs, src, Some(queue))
    }

    fn set_range_impl(
        &mut self,
        dst_ofs: usize,
        src: &[u8],
        queue: Option<QueueToken>,
    ) -> Result<()> {
        verify_arg!(
            dst_ofs,
            dst_ofs
                .checked_add(src.len())
                .is_some_and(|end| end <= self.size)
        );
        if src.is_empty() {
            return Ok(());
        }
        let owner = self.owner.unwrap_or(Backend::Host);
        self.transition(owner, true, queue, self.size)?;
        match owner {
            Backend::Shared => {
                let handle = self.shared.expect("shared handle");
                self.env
                    .shared()
                    .upload(handle, dst_ofs, src)
                    .map_err(|e| self.backend_err(Backend::Shared, "upload", e))?;
            }
            Backend::Accel => {
                let ptr = self.accel.expect("accel block").ptr;
                let id = self.id;
                let env = self.env.clone();
                run_bisecting(src.len(), "copy_in", |ofs, len| {
                    env.accel()
                        .copy_in(ptr.offset(dst_ofs + ofs), &src[ofs..ofs + len], queue)
                })
                .map_err(|e| Error::backend("accel", "copy_in", id, e))?;
            }
            Backend::Host => {
                let host = self.host.as_mut().expect("host storage");
                host.slice_mut(dst_ofs, src.len()).copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Reads `dst.len()` bytes starting at `src_ofs` from the owning
    /// backend. Never mutates coherence state; the data must already be
    /// valid in the owner.
    pub fn get_range(&self, dst: &mut [u8], src_ofs: usize) -> Result<()> {
        self.get_range_impl(dst, src_ofs, None)
    }

    /// Asynchronous variant of [`get_range`](Self::get_range).
    pub fn get_range_async(&self, dst: &mut [u8], src_ofs: usize, queue: QueueToken) -> Result<()> {
        self.get_range_impl(dst, src_ofs, Some(queue))
    }

    fn get_range_impl(
        &self,
        dst: &mut [u8],
        src_ofs: usize,
        queue: Option<QueueToken>,
    ) -> Result<()> {
        verify_arg!(
            src_ofs,
            src_ofs
                .checked_add(dst.len())
                .is_some_and(|end| end <= self.size)
        );
        if dst.is_empty() {
            return Ok(());
        }
        match self.owner {
            Some(Backend::Shared) => {
                let handle = self.shared.expect("shared handle");
                self.env
                    .shared()
                    .download(handle, src_ofs, dst)
                    .map_err(|e| self.backend_err(Backend::Shared, "download", e))?;
            }
            Some(Backend::Accel) => {
                let ptr = self.accel.expect("accel block").ptr;
                let id = self.id;
                let env = self.env.clone();
                run_bisecting(dst.len(), "copy_out", |ofs, len| {
                    env.accel()
                        .copy_out(&mut dst[ofs..ofs + len], ptr.offset(src_ofs + ofs), queue)
                })
                .map_err(|e| Error::backend("accel", "copy_out", id, e))?;
            }
            _ => {
                let host = self
                    .host
                    .as_ref()
                    .ok_or_else(|| Error::invalid_operation("read from an unallocated buffer"))?;
                dst.copy_from_slice(host.slice(src_ofs, dst.len()));
            }
        }
        Ok(())
    }

    /// Copies `len` bytes from another buffer, picking the cheapest path
    /// that does not force a data migration on either side: an
    /// accelerator-to-accelerator copy when both device copies are
    /// current, a host-sourced write when the source's host copy is
    /// current, and a read into this buffer's host storage otherwise.
    pub fn copy_range_from(
        &mut self,
        dst_ofs: usize,
        src: &mut Buffer,
        src_ofs: usize,
        len: usize,
    ) -> Result<()> {
        self.copy_range_from_impl(dst_ofs, src, src_ofs, len, None)
    }

    /// Asynchronous variant of [`copy_range_from`](Self::copy_range_from).
    pub fn copy_range_from_async(
        &mut self,
        dst_ofs: usize,
        src: &mut Buffer,
        src_ofs: usize,
        len: usize,
        queue: QueueToken,
    ) -> Result<()> {
        self.copy_range_from_impl(dst_ofs, src, src_ofs, len, Some(queue))
    }

    fn copy_range_from_impl(
        &mut self,
        dst_ofs: usize,
        src: &mut Buffer,
        src_ofs: usize,
        len: usize,
        queue: Option<QueueToken>,
    ) -> Result<()> {
        verify_arg!(
            dst_ofs,
            dst_ofs.checked_add(len).is_some_and(|end| end <= self.size)
        );
        verify_arg!(
            src_ofs,
            src_ofs.checked_add(len).is_some_and(|end| end <= src.size)
        );
        if len == 0 {
            return Ok(());
        }

        if self.owner == Some(Backend::Accel)
            && src.exists.contains(BackendSet::ACCEL)
            && !src.dirty.contains(BackendSet::ACCEL)
        {
            // Both device copies are current: stay on the accelerator.
            self.transition(Backend::Accel, true, queue, self.size)?;
            src.transition(Backend::Accel, false, None, src.size)?;
            let dst_ptr = self.accel.expect("accel block").ptr.offset(dst_ofs);
            let src_ptr = src.accel.expect("accel block").ptr.offset(src_ofs);
            let id = self.id;
            let env = self.env.clone();
            run_bisecting(len, "copy_device", |ofs, n| {
                env.accel()
                    .copy_device(dst_ptr.offset(ofs), src_ptr.offset(ofs), n)
            })
            .map_err(|e| Error::backend("accel", "copy_device", id, e))?;
        } else if src.exists.contains(BackendSet::HOST) && !src.dirty.contains(BackendSet::HOST) {
            let data = src.host.as_ref().expect("host storage").slice(src_ofs, len);
            self.set_range_impl(dst_ofs, data, queue)?;
        } else {
            self.transition(Backend::Host, true, queue, self.size)?;
            let host = self.host.as_mut().expect("host storage");
            src.get_range_impl(host.slice_mut(dst_ofs, len), src_ofs, queue)?;
        }
        Ok(())
    }
}

impl Buffer {
    /// Changes size, hints, and alignment, preserving content where the
    /// new and old ranges overlap.
    ///
    /// Wrapped buffers cannot change size; only their metadata is updated
    /// and all non-wrapped backends are released. When there is no content
    /// worth preserving the buffer simply resets and reallocates lazily.
    pub fn realloc(&mut self, new_size: usize, new_hints: Hints, new_align: usize) -> Result<()> {
        verify_arg!(new_align, new_align > 0 && new_align.is_power_of_two());
        let mut new_hints = new_hints;
        if new_align != 1 || self.original == Some(Backend::Accel) {
            new_hints.remove(Hints::ALLOW_ALIASING);
        }
        if self.original == Some(Backend::Host) {
            new_hints.remove(Hints::PAGE_LOCKED);
        }

        if self.size == new_size && self.hints == new_hints && self.align == new_align {
            return Ok(());
        }

        if self.original.is_some() {
            // The external allocation is fixed; the engine may not resize
            // or move it.
            verify_arg!(new_size, new_size == self.size);
            match self.original {
                Some(Backend::Host) => {
                    let ptr = self.host.as_ref().expect("host storage").as_ptr();
                    verify_arg!(new_align, unibuf_alloc::align::is_ptr_aligned(ptr, new_align));
                }
                Some(Backend::Accel) => {
                    let ptr = self.accel.expect("accel block").ptr;
                    verify_arg!(new_align, ptr.0 % new_align as u64 == 0);
                }
                _ => {}
            }
            for backend in Backend::ALL {
                self.free(backend)?;
            }
            self.hints = new_hints;
            self.align = new_align;
            return Ok(());
        }

        if new_size == 0 || self.size == 0 || self.exists.is_empty() {
            return self.reset(new_size, new_hints, new_align);
        }

        if self.owner == Some(Backend::Accel) && !new_hints.contains(Hints::ALLOW_ALIASING) {
            // Preserve on the device, skipping the host round trip.
            let copy_len = new_size.min(self.size);
            let id = self.id;
            let env = self.env.clone();
            let new_ptr = env
                .accel()
                .alloc(new_size, new_align)
                .map_err(|e| Error::backend("accel", "alloc", id, e))?;
            let old_ptr = self.accel.expect("accel block").ptr;
            run_bisecting(copy_len, "copy_device", |ofs, len| {
                env.accel()
                    .copy_device(new_ptr.offset(ofs), old_ptr.offset(ofs), len)
            })
            .map_err(|e| Error::backend("accel", "copy_device", id, e))?;

            self.reset(new_size, new_hints, new_align)?;
            self.accel = Some(AccelBlock {
                ptr: new_ptr,
                aliased: false,
            });
            self.exists = BackendSet::ACCEL;
            self.owner = Some(Backend::Accel);
            return Ok(());
        }

        // Preserve through a fresh host allocation.
        let copy_len = new_size.min(self.size);
        self.transition(Backend::Host, false, None, self.size)?;
        let mut new_host = HostStorage::alloc(new_size, new_align, new_hints)
            .map_err(|e| self.backend_err(Backend::Host, "alloc", e))?;
        new_host
            .slice_mut(0, copy_len)
            .copy_from_slice(self.host.as_ref().expect("host storage").slice(0, copy_len));
        self.reset(new_size, new_hints, new_align)?;
        self.host = Some(new_host);
        self.exists = BackendSet::HOST;
        self.owner = Some(Backend::Host);
        Ok(())
    }

    /// Resizes, preserving the overlapping content.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        self.realloc(new_size, self.hints, self.align)
    }

    /// Resizes without preserving content. Backends are released and
    /// reallocated lazily on the next access.
    pub fn resize_discard(&mut self, new_size: usize) -> Result<()> {
        if new_size == self.size {
            return Ok(());
        }
        verify_arg!(new_size, self.original.is_none());
        self.reset(new_size, self.hints, self.align)
    }

    /// Changes hints and alignment while keeping the size. Hints the
    /// current configuration cannot honor are stripped.
    pub fn set_hints_and_align(&mut self, hints: Hints, align: usize) -> Result<()> {
        self.realloc(self.size, hints, align)
    }

    /// Releases one backend's allocation. A no-op when the backend does
    /// not exist, is the only existing copy, or is the wrapped original.
    /// When the owner is freed, ownership re-homes to a clean surviving
    /// backend if one exists, else to any survivor (validated first).
    pub fn free(&mut self, backend: Backend) -> Result<()> {
        if !self.exists.contains(backend.bit())
            || self.exists == backend.bit()
            || self.original == Some(backend)
        {
            return Ok(());
        }

        // An aliased accelerator view cannot outlive the shared buffer it
        // maps; tear it down first so re-homing below never picks it.
        if backend == Backend::Shared && self.accel.is_some_and(|b| b.aliased) {
            self.release_accel("unmap_shared")?;
            self.dirty.remove(BackendSet::SHARED);
            if self.owner == Some(Backend::Accel) {
                self.owner = Some(Backend::Shared);
            }
            if self.exists == backend.bit() {
                return Ok(());
            }
        }

        if self.owner == Some(backend) {
            let survivor = Backend::ALL
                .into_iter()
                .find(|&b| {
                    b != backend
                        && self.exists.contains(b.bit())
                        && !self.dirty.contains(b.bit())
                })
                .or_else(|| {
                    Backend::ALL
                        .into_iter()
                        .find(|&b| b != backend && self.exists.contains(b.bit()))
                })
                .expect("surviving backend");
            self.transition(survivor, false, None, self.size)?;
        }

        match backend {
            Backend::Host => self.release_host(),
            Backend::Shared => self.release_shared("free")?,
            Backend::Accel => self.release_accel("free")?,
        }
        Ok(())
    }

    /// Releases every owned backend and re-arms lazy allocation with the
    /// new metadata. Only valid for non-wrapped buffers.
    fn reset(&mut self, new_size: usize, hints: Hints, align: usize) -> Result<()> {
        debug_assert!(self.original.is_none());
        self.release_accel("free")?;
        self.release_shared("free")?;
        self.release_host();
        self.owner = None;
        self.size = new_size;
        self.hints = hints;
        self.align = align;
        debug_assert!(self.exists.is_empty() && self.dirty.is_empty());
        Ok(())
    }

    fn release_host(&mut self) {
        self.host = None;
        self.exists.remove(BackendSet::HOST);
        self.dirty.remove(BackendSet::HOST);
    }

    fn release_shared(&mut self, operation: &'static str) -> Result<()> {
        // Unmap an aliased accelerator view before deleting its storage.
        if self.accel.is_some_and(|b| b.aliased) {
            self.release_accel(operation)?;
        }
        if let Some(handle) = self.shared.take() {
            self.exists.remove(BackendSet::SHARED);
            self.dirty.remove(BackendSet::SHARED);
            self.env
                .shared()
                .free(handle)
                .map_err(|e| Error::backend("shared", operation, self.id, e))?;
        }
        Ok(())
    }

    fn release_accel(&mut self, operation: &'static str) -> Result<()> {
        if let Some(block) = self.accel.take() {
            self.exists.remove(BackendSet::ACCEL);
            self.dirty.remove(BackendSet::ACCEL);
            let res = if block.aliased {
                let handle = self.shared.expect("shared handle");
                self.env.accel().unmap_shared(handle)
            } else {
                self.env.accel().free(block.ptr)
            };
            res.map_err(|e| Error::backend("accel", operation, self.id, e))?;
        }
        Ok(())
    }
}

impl Buffer {
    /// Read view of the host copy, validating it first.
    pub fn as_slice(&mut self) -> Result<&[u8]> {
        if self.size == 0 {
            return Ok(&[]);
        }
        self.transition(Backend::Host, false, None, self.size)?;
        Ok(self.host.as_ref().expect("host storage").slice(0, self.size))
    }

    /// Write view of the host copy; every other backend becomes stale.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if self.size == 0 {
            return Ok(&mut []);
        }
        self.transition(Backend::Host, true, None, self.size)?;
        let size = self.size;
        Ok(self.host.as_mut().expect("host storage").slice_mut(0, size))
    }

    /// Typed read view of the host copy.
    ///
    /// # Panics
    ///
    /// Panics if the host pointer is misaligned for `T` or the size is not
    /// a multiple of `size_of::<T>()`.
    pub fn typed_data<T>(&mut self) -> Result<&[T]>
    where
        T: bytemuck::AnyBitPattern,
    {
        Ok(bytemuck::cast_slice(self.as_slice()?))
    }

    /// Typed write view of the host copy.
    ///
    /// # Panics
    ///
    /// Same conditions as [`typed_data`](Self::typed_data).
    pub fn typed_data_mut<T>(&mut self) -> Result<&mut [T]>
    where
        T: bytemuck::AnyBitPattern + bytemuck::NoUninit,
    {
        Ok(bytemuck::cast_slice_mut(self.as_mut_slice()?))
    }

    /// Handle of the validated shared-backend allocation, for read access.
    pub fn shared_handle(&mut self) -> Result<SharedHandle> {
        self.require_backing("shared_handle")?;
        self.transition(Backend::Shared, false, None, self.size)?;
        Ok(self.shared.expect("shared handle"))
    }

    /// Handle of the shared-backend allocation with write intent; every
    /// other backend becomes stale.
    pub fn shared_handle_mut(&mut self) -> Result<SharedHandle> {
        self.require_backing("shared_handle_mut")?;
        self.transition(Backend::Shared, true, None, self.size)?;
        Ok(self.shared.expect("shared handle"))
    }

    /// Device address of the validated accelerator copy, for read access.
    pub fn accel_ptr(&mut self) -> Result<DevicePtr> {
        self.require_backing("accel_ptr")?;
        self.transition(Backend::Accel, false, None, self.size)?;
        Ok(self.accel.expect("accel block").ptr)
    }

    /// Device address of the accelerator copy with write intent; every
    /// other backend becomes stale.
    pub fn accel_ptr_mut(&mut self) -> Result<DevicePtr> {
        self.require_backing("accel_ptr_mut")?;
        self.transition(Backend::Accel, true, None, self.size)?;
        Ok(self.accel.expect("accel block").ptr)
    }

    fn require_backing(&self, operation: &str) -> Result<()> {
        if self.size == 0 {
            Err(Error::invalid_operation(format!(
                "{operation} on an empty buffer"
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Release order matters: an aliased accelerator mapping must be
        // unmapped before the shared buffer it maps is deleted.
        if self.original == Some(Backend::Accel) {
            self.accel = None;
        } else if let Err(err) = self.release_accel("free") {
            log::error!("buffer #{}: releasing accel backend failed: {err}", self.id);
        }
        if self.original == Some(Backend::Shared) {
            self.shared = None;
        } else if let Err(err) = self.release_shared("free") {
            log::error!(
                "buffer #{}: releasing shared backend failed: {err}",
                self.id
            );
        }
        // Owned host storage frees itself; a wrapped region is untouched.
        self.host = None;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .field("exists", &self.exists)
            .field("dirty", &self.dirty)
            .field("hints", &self.hints)
            .field("original", &self.original)
            .finish_non_exhaustive()
    }
}
