use std::sync::OnceLock;

/// Allocates `size` bytes of page-aligned memory via anonymous mmap.
///
/// Returns the pointer and the actual capacity, which is `size` rounded up
/// to the page boundary. The memory is readable, writable, and zeroed.
pub fn allocate(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let page_size = get_page_size();
    assert!(page_size.is_power_of_two());
    let capacity = (size.max(1) + page_size - 1) & !(page_size - 1);
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr.is_null() || ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok((ptr as *mut u8, capacity))
}

/// Frees memory allocated by [`allocate`].
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] and `capacity` must be the
/// capacity returned alongside it; the memory must not have been freed yet.
pub unsafe fn free(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munmap(ptr as *mut std::ffi::c_void, capacity) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Locks the pages of the given region into physical memory (`mlock`),
/// preventing them from being paged out.
///
/// Fails with the OS error when the process lacks the privilege or exceeds
/// `RLIMIT_MEMLOCK`.
///
/// # Safety
///
/// The region must be a live mapping obtained from [`allocate`].
pub unsafe fn try_lock(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    let res = unsafe { libc::mlock(ptr as *const std::ffi::c_void, capacity) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Unlocks pages previously locked with [`try_lock`].
///
/// # Safety
///
/// Same region requirements as [`try_lock`].
pub unsafe fn unlock(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munlock(ptr as *const std::ffi::c_void, capacity) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Gets the system's standard page size in bytes, cached after the first
/// call.
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    if let Some(&size) = SIZE.get() {
        size
    } else {
        match read_page_size() {
            Ok(size) => {
                let _ = SIZE.set(size);
                size
            }
            Err(_) => 4 * 1024,
        }
    }
}

fn read_page_size() -> std::io::Result<usize> {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    assert!(res < i32::MAX as _);
    Ok(res as usize)
}
