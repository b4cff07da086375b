//! Host-memory allocation primitives for the unibuf engine:
//! alignment helpers, aligned heap allocations, and page-locked
//! ("pinned") allocations that cannot be paged out.

pub mod align;
pub mod aligned;
pub mod pinned;

#[cfg_attr(any(target_os = "linux"), path = "mlock_linux.rs")]
#[cfg_attr(not(any(target_os = "linux")), path = "mlock_fallback.rs")]
pub mod mlock;
