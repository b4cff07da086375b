//! Adapter contracts for the two device-owned backends.
//!
//! The engine depends only on these traits; the rendering-API and compute-API
//! glue lives behind them. Methods take `&self` and implementations must be
//! internally synchronized, since several buffers may share one adapter.
//! All methods report failure through `std::io::Result` at this seam; the
//! engine attributes errors to a backend, operation, and buffer above it.

use std::sync::Arc;

/// Opaque identifier of a rendering-API shared buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle(pub u64);

/// Opaque accelerator memory address.
///
/// Plain integer arithmetic is deliberate: the engine forms sub-range
/// addresses by offsetting, exactly as a device pointer behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    #[inline]
    pub fn offset(self, n: usize) -> DevicePtr {
        DevicePtr(self.0 + n as u64)
    }
}

/// Completion-ordering token for asynchronous transfers (a stream/queue in
/// the compute API). The engine passes it through without interpreting it
/// and never waits on it; sequencing and synchronization are the caller's
/// responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueToken(pub u64);

/// Allocation and transfer primitives of the rendering-API shared-buffer
/// backend.
pub trait SharedMemory: Send + Sync + 'static {
    /// Allocates a shared buffer of `size` bytes. When `seed` is given it
    /// must be exactly `size` bytes and becomes the initial content (the
    /// allocation call takes the source directly where the API supports it).
    fn alloc(&self, size: usize, seed: Option<&[u8]>) -> std::io::Result<SharedHandle>;

    /// Releases an allocation previously returned by [`alloc`](Self::alloc).
    fn free(&self, handle: SharedHandle) -> std::io::Result<()>;

    /// Size in bytes of an existing allocation.
    fn size_of(&self, handle: SharedHandle) -> std::io::Result<usize>;

    /// Writes `src` into the allocation at byte `offset`.
    fn upload(&self, handle: SharedHandle, offset: usize, src: &[u8]) -> std::io::Result<()>;

    /// Reads `dst.len()` bytes from the allocation at byte `offset`.
    fn download(&self, handle: SharedHandle, offset: usize, dst: &mut [u8]) -> std::io::Result<()>;
}

/// Allocation and transfer primitives of the accelerator-memory backend.
///
/// Copy primitives may reject a transfer above an implementation-defined
/// size limit; the engine recovers by bisecting the range, so rejection is
/// not necessarily fatal.
pub trait AccelMemory: Send + Sync + 'static {
    /// Allocates `size` bytes of device memory aligned to `align`.
    fn alloc(&self, size: usize, align: usize) -> std::io::Result<DevicePtr>;

    /// Releases memory previously returned by [`alloc`](Self::alloc).
    fn free(&self, ptr: DevicePtr) -> std::io::Result<()>;

    /// Maps a rendering-API shared buffer into device memory, aliasing its
    /// physical storage. The mapping stays valid until
    /// [`unmap_shared`](Self::unmap_shared).
    fn map_shared(&self, handle: SharedHandle) -> std::io::Result<DevicePtr>;

    /// Releases the aliasing lease obtained from
    /// [`map_shared`](Self::map_shared).
    fn unmap_shared(&self, handle: SharedHandle) -> std::io::Result<()>;

    /// Host-to-device copy. `queue: Some(_)` issues the copy asynchronously
    /// against that ordering token and returns without waiting.
    fn copy_in(&self, dst: DevicePtr, src: &[u8], queue: Option<QueueToken>)
    -> std::io::Result<()>;

    /// Device-to-host copy, with the same asynchrony rule as
    /// [`copy_in`](Self::copy_in).
    fn copy_out(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        queue: Option<QueueToken>,
    ) -> std::io::Result<()>;

    /// Device-to-device copy of `len` bytes.
    fn copy_device(&self, dst: DevicePtr, src: DevicePtr, len: usize) -> std::io::Result<()>;
}

/// The pair of device-backend adapters a buffer operates against.
///
/// Cloning is cheap; every buffer holds its own copy.
#[derive(Clone)]
pub struct BackendEnv {
    shared: Arc<dyn SharedMemory>,
    accel: Arc<dyn AccelMemory>,
}

impl BackendEnv {
    pub fn new(shared: Arc<dyn SharedMemory>, accel: Arc<dyn AccelMemory>) -> BackendEnv {
        BackendEnv { shared, accel }
    }

    #[inline]
    pub fn shared(&self) -> &dyn SharedMemory {
        self.shared.as_ref()
    }

    #[inline]
    pub fn accel(&self) -> &dyn AccelMemory {
        self.accel.as_ref()
    }
}
