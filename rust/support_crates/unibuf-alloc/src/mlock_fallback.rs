use std::alloc::{Layout, alloc_zeroed, dealloc};

/// Allocates `size` bytes of page-aligned memory (emulated via the global
/// allocator on platforms without the mmap/mlock path).
pub fn allocate(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let page_size = get_page_size();
    assert!(page_size.is_power_of_two());
    let capacity = (size.max(1) + page_size - 1) & !(page_size - 1);

    let layout = Layout::from_size_align(capacity, page_size)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid layout"))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "failed to allocate memory",
        ));
    }
    Ok((ptr, capacity))
}

/// Frees memory allocated by [`allocate`].
///
/// # Safety
///
/// `ptr`/`capacity` must come from a single prior [`allocate`] call and the
/// memory must not have been freed yet.
pub unsafe fn free(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    let page_size = get_page_size();
    assert!(capacity.is_multiple_of(page_size));

    let layout = Layout::from_size_align(capacity, page_size)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid layout"))?;
    unsafe {
        dealloc(ptr, layout);
    }
    Ok(())
}

/// Page locking is not available on this platform.
///
/// # Safety
///
/// No requirements; the call never touches the region.
pub unsafe fn try_lock(_ptr: *mut u8, _capacity: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "page locking is not supported on this platform",
    ))
}

/// No-op counterpart of [`try_lock`].
///
/// # Safety
///
/// No requirements.
pub unsafe fn unlock(_ptr: *mut u8, _capacity: usize) -> std::io::Result<()> {
    Ok(())
}

/// Returns the assumed page size in bytes.
pub fn get_page_size() -> usize {
    4 * 1024
}
