//! Backend identity and the bit-set state the coherence protocol runs on.

use bitflags::bitflags;

/// One of the three physical storage locations a buffer's bytes may reside
/// in. The set is closed by design: the protocol dispatches on it with
/// exhaustive matches instead of dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Process (host) memory.
    Host,
    /// A shared buffer owned by the rendering API.
    Shared,
    /// Dedicated accelerator (device) memory.
    Accel,
}

impl Backend {
    /// All backends, in the order the protocol prefers to read from:
    /// host first, then the shared buffer, then the accelerator.
    pub const ALL: [Backend; 3] = [Backend::Host, Backend::Shared, Backend::Accel];

    /// The corresponding bit in a [`BackendSet`].
    #[inline]
    pub fn bit(self) -> BackendSet {
        match self {
            Backend::Host => BackendSet::HOST,
            Backend::Shared => BackendSet::SHARED,
            Backend::Accel => BackendSet::ACCEL,
        }
    }

    /// Short lowercase name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Host => "host",
            Backend::Shared => "shared",
            Backend::Accel => "accel",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// A set of backends; used for both the `exists` and `dirty` state of a
    /// buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackendSet: u8 {
        const HOST = 1;
        const SHARED = 2;
        const ACCEL = 4;
    }
}

bitflags! {
    /// Allocation behavior hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Hints: u8 {
        /// Allocate the host backend as page-locked memory so asynchronous
        /// device transfers can stream from it directly.
        const PAGE_LOCKED = 1;
        /// Let the accelerator backend alias the rendering-API backend's
        /// physical storage instead of holding an independent copy.
        /// Requires an alignment of 1.
        const ALLOW_ALIASING = 2;
    }
}

/// Declared access intent when requesting ownership of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The caller will only read; other backends' copies stay valid.
    Read,
    /// The caller will write; every other backend's copy becomes stale.
    Write,
}

impl Access {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Access::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let mut set = BackendSet::empty();
        for backend in Backend::ALL {
            assert!(!set.intersects(backend.bit()));
            set |= backend.bit();
        }
        assert_eq!(set, BackendSet::all());
    }

    #[test]
    fn test_set_operations() {
        let mut set = BackendSet::HOST | BackendSet::ACCEL;
        assert!(set.contains(Backend::Host.bit()));
        assert!(!set.contains(Backend::Shared.bit()));
        set.remove(BackendSet::ACCEL);
        assert_eq!(set, BackendSet::HOST);
    }
}
