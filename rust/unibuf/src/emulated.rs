//! In-memory reference implementations of the device-backend adapters.
//!
//! `EmulatedDevice` serves both the shared-buffer and accelerator
//! contracts over plain host memory, with one storage registry so that an
//! aliasing map genuinely shares bytes with the shared buffer it maps. It
//! also records operation counters, an optional per-copy size limit, and a
//! log of accepted device copies, which the protocol tests rely on.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::adapter::{AccelMemory, BackendEnv, DevicePtr, QueueToken, SharedHandle, SharedMemory};

/// Counts of adapter calls, including rejected ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub shared_alloc: u64,
    pub shared_free: u64,
    pub upload: u64,
    pub download: u64,
    pub accel_alloc: u64,
    pub accel_free: u64,
    pub map_shared: u64,
    pub unmap_shared: u64,
    pub copy_in: u64,
    pub copy_out: u64,
    pub copy_device: u64,
}

/// An in-memory device serving both the [`SharedMemory`] and
/// [`AccelMemory`] contracts.
///
/// Clones share the same storage; hand [`env`](Self::env) to buffers and
/// keep a clone around for inspection.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    shared: HashMap<u64, Vec<u8>>,
    accel: BTreeMap<u64, AccelBlock>,
    next_shared: u64,
    next_accel: u64,
    counts: OpCounts,
    copy_limit: Option<usize>,
    copy_log: Vec<(u64, usize)>,
    last_queue: Option<QueueToken>,
}

struct AccelBlock {
    len: usize,
    data: BlockData,
}

enum BlockData {
    Owned(Vec<u8>),
    Alias(u64),
}

impl EmulatedDevice {
    pub fn new() -> EmulatedDevice {
        EmulatedDevice {
            inner: Arc::new(Mutex::new(Inner {
                shared: HashMap::new(),
                accel: BTreeMap::new(),
                next_shared: 1,
                next_accel: 0x1000,
                counts: OpCounts::default(),
                copy_limit: None,
                copy_log: Vec::new(),
                last_queue: None,
            })),
        }
    }

    /// A backend environment with this device serving both device
    /// backends.
    pub fn env(&self) -> BackendEnv {
        BackendEnv::new(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    pub fn counts(&self) -> OpCounts {
        self.lock().counts
    }

    pub fn reset_counts(&self) {
        self.lock().counts = OpCounts::default();
    }

    /// Rejects any single device copy larger than `limit` bytes, forcing
    /// the engine's bisection fallback.
    pub fn set_copy_limit(&self, limit: Option<usize>) {
        self.lock().copy_limit = limit;
    }

    /// Accepted device copies as `(device address, length)` in issue
    /// order.
    pub fn copy_log(&self) -> Vec<(u64, usize)> {
        self.lock().copy_log.clone()
    }

    pub fn clear_copy_log(&self) {
        self.lock().copy_log.clear();
    }

    /// Ordering token of the most recent asynchronous device copy.
    pub fn last_queue(&self) -> Option<QueueToken> {
        self.lock().last_queue
    }

    /// Snapshot of a shared allocation's content.
    pub fn shared_bytes(&self, handle: SharedHandle) -> Option<Vec<u8>> {
        self.lock().shared.get(&handle.0).cloned()
    }

    /// Number of live device-side allocations, mappings included.
    pub fn live_allocations(&self) -> usize {
        let inner = self.lock();
        inner.shared.len() + inner.accel.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("emulated device lock")
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check_limit(&self, len: usize) -> std::io::Result<()> {
        match self.copy_limit {
            Some(limit) if len > limit => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "transfer exceeds device copy limit",
            )),
            _ => Ok(()),
        }
    }

    fn find_block(&self, ptr: u64, len: usize) -> std::io::Result<(u64, usize)> {
        let (&base, block) = self.accel.range(..=ptr).next_back().ok_or_else(bad_ptr)?;
        let offset = (ptr - base) as usize;
        if offset.checked_add(len).is_none_or(|end| end > block.len) {
            return Err(bad_ptr());
        }
        Ok((base, offset))
    }

    fn with_block_mut<R>(
        &mut self,
        ptr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> std::io::Result<R> {
        let (base, offset) = self.find_block(ptr, len)?;
        let alias = match &self.accel.get(&base).expect("block").data {
            BlockData::Owned(_) => None,
            BlockData::Alias(handle) => Some(*handle),
        };
        let slice = match alias {
            None => match &mut self.accel.get_mut(&base).expect("block").data {
                BlockData::Owned(vec) => &mut vec[offset..offset + len],
                BlockData::Alias(_) => unreachable!(),
            },
            Some(handle) => {
                let vec = self.shared.get_mut(&handle).ok_or_else(bad_ptr)?;
                if offset + len > vec.len() {
                    return Err(bad_ptr());
                }
                &mut vec[offset..offset + len]
            }
        };
        Ok(f(slice))
    }
}

fn bad_ptr() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "invalid device pointer range",
    )
}

fn unknown_handle() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown shared handle")
}

impl SharedMemory for EmulatedDevice {
    fn alloc(&self, size: usize, seed: Option<&[u8]>) -> std::io::Result<SharedHandle> {
        let mut inner = self.lock();
        inner.counts.shared_alloc += 1;
        if seed.is_some_and(|s| s.len() != size) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seed length mismatch",
            ));
        }
        let data = seed.map(<[u8]>::to_vec).unwrap_or_else(|| vec![0; size]);
        let handle = inner.next_shared;
        inner.next_shared += 1;
        inner.shared.insert(handle, data);
        Ok(SharedHandle(handle))
    }

    fn free(&self, handle: SharedHandle) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.shared_free += 1;
        let mapped = inner
            .accel
            .values()
            .any(|b| matches!(b.data, BlockData::Alias(h) if h == handle.0));
        if mapped {
            return Err(std::io::Error::other("shared buffer is still mapped"));
        }
        inner
            .shared
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(unknown_handle)
    }

    fn size_of(&self, handle: SharedHandle) -> std::io::Result<usize> {
        self.lock()
            .shared
            .get(&handle.0)
            .map(Vec::len)
            .ok_or_else(unknown_handle)
    }

    fn upload(&self, handle: SharedHandle, offset: usize, src: &[u8]) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.upload += 1;
        let vec = inner.shared.get_mut(&handle.0).ok_or_else(unknown_handle)?;
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= vec.len())
            .ok_or_else(bad_ptr)?;
        vec[offset..end].copy_from_slice(src);
        Ok(())
    }

    fn download(&self, handle: SharedHandle, offset: usize, dst: &mut [u8]) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.download += 1;
        let vec = inner.shared.get(&handle.0).ok_or_else(unknown_handle)?;
        let end = offset
            .checked_add(dst.len())
            .filter(|&end| end <= vec.len())
            .ok_or_else(bad_ptr)?;
        dst.copy_from_slice(&vec[offset..end]);
        Ok(())
    }
}

impl AccelMemory for EmulatedDevice {
    fn alloc(&self, size: usize, align: usize) -> std::io::Result<DevicePtr> {
        let mut inner = self.lock();
        inner.counts.accel_alloc += 1;
        let align = align.max(1) as u64;
        let base = (inner.next_accel + align - 1) & !(align - 1);
        // Guard gap so out-of-range pointers never land in a neighbor.
        inner.next_accel = base + size.max(1) as u64 + 0x100;
        inner.accel.insert(
            base,
            AccelBlock {
                len: size,
                data: BlockData::Owned(vec![0; size]),
            },
        );
        Ok(DevicePtr(base))
    }

    fn free(&self, ptr: DevicePtr) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.accel_free += 1;
        match inner.accel.get(&ptr.0) {
            Some(block) if matches!(block.data, BlockData::Owned(_)) => {
                inner.accel.remove(&ptr.0);
                Ok(())
            }
            Some(_) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "pointer is a shared mapping",
            )),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unknown device pointer",
            )),
        }
    }

    fn map_shared(&self, handle: SharedHandle) -> std::io::Result<DevicePtr> {
        let mut inner = self.lock();
        inner.counts.map_shared += 1;
        let len = inner
            .shared
            .get(&handle.0)
            .map(Vec::len)
            .ok_or_else(unknown_handle)?;
        let base = inner.next_accel;
        inner.next_accel = base + len.max(1) as u64 + 0x100;
        inner.accel.insert(
            base,
            AccelBlock {
                len,
                data: BlockData::Alias(handle.0),
            },
        );
        Ok(DevicePtr(base))
    }

    fn unmap_shared(&self, handle: SharedHandle) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.unmap_shared += 1;
        let base = inner
            .accel
            .iter()
            .find(|(_, b)| matches!(b.data, BlockData::Alias(h) if h == handle.0))
            .map(|(&base, _)| base)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "handle is not mapped")
            })?;
        inner.accel.remove(&base);
        Ok(())
    }

    fn copy_in(
        &self,
        dst: DevicePtr,
        src: &[u8],
        queue: Option<QueueToken>,
    ) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.copy_in += 1;
        inner.check_limit(src.len())?;
        inner.with_block_mut(dst.0, src.len(), |s| s.copy_from_slice(src))?;
        inner.copy_log.push((dst.0, src.len()));
        if queue.is_some() {
            inner.last_queue = queue;
        }
        Ok(())
    }

    fn copy_out(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        queue: Option<QueueToken>,
    ) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.copy_out += 1;
        inner.check_limit(dst.len())?;
        inner.with_block_mut(src.0, dst.len(), |s| dst.copy_from_slice(s))?;
        inner.copy_log.push((src.0, dst.len()));
        if queue.is_some() {
            inner.last_queue = queue;
        }
        Ok(())
    }

    fn copy_device(&self, dst: DevicePtr, src: DevicePtr, len: usize) -> std::io::Result<()> {
        let mut inner = self.lock();
        inner.counts.copy_device += 1;
        inner.check_limit(len)?;
        let tmp = inner.with_block_mut(src.0, len, |s| s.to_vec())?;
        inner.with_block_mut(dst.0, len, |s| s.copy_from_slice(&tmp))?;
        inner.copy_log.push((dst.0, len));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_alloc_seed_and_transfer() {
        let dev = EmulatedDevice::new();
        let handle = SharedMemory::alloc(&dev, 4, Some(b"abcd")).expect("alloc");
        assert_eq!(dev.shared_bytes(handle).as_deref(), Some(b"abcd".as_ref()));

        dev.upload(handle, 1, b"XY").expect("upload");
        let mut out = [0u8; 4];
        dev.download(handle, 0, &mut out).expect("download");
        assert_eq!(&out, b"aXYd");
    }

    #[test]
    fn test_accel_round_trip_with_offsets() {
        let dev = EmulatedDevice::new();
        let ptr = AccelMemory::alloc(&dev, 8, 64).expect("alloc");
        assert_eq!(ptr.0 % 64, 0);
        dev.copy_in(ptr.offset(2), b"zz", None).expect("copy_in");
        let mut out = [0u8; 8];
        dev.copy_out(&mut out, ptr, None).expect("copy_out");
        assert_eq!(&out, b"\0\0zz\0\0\0\0");
    }

    #[test]
    fn test_alias_shares_storage() {
        let dev = EmulatedDevice::new();
        let handle = SharedMemory::alloc(&dev, 4, Some(b"0000")).expect("alloc");
        let ptr = dev.map_shared(handle).expect("map");
        dev.copy_in(ptr, b"abcd", None).expect("copy_in");
        assert_eq!(dev.shared_bytes(handle).as_deref(), Some(b"abcd".as_ref()));

        // Freeing while mapped must be rejected.
        assert!(SharedMemory::free(&dev, handle).is_err());
        dev.unmap_shared(handle).expect("unmap");
        SharedMemory::free(&dev, handle).expect("free");
    }

    #[test]
    fn test_copy_limit_rejects() {
        let dev = EmulatedDevice::new();
        let ptr = AccelMemory::alloc(&dev, 64, 1).expect("alloc");
        dev.set_copy_limit(Some(16));
        assert!(dev.copy_in(ptr, &[0u8; 32], None).is_err());
        dev.copy_in(ptr, &[0u8; 16], None).expect("within limit");
    }

    #[test]
    fn test_out_of_range_pointer_is_rejected() {
        let dev = EmulatedDevice::new();
        let ptr = AccelMemory::alloc(&dev, 8, 1).expect("alloc");
        assert!(dev.copy_in(ptr.offset(5), &[0u8; 8], None).is_err());
        assert!(dev.copy_in(DevicePtr(1), &[0u8; 1], None).is_err());
    }
}
