//! A single logical byte buffer coherently mirrored across up to three
//! storage backends: host memory, a rendering-API shared buffer, and
//! accelerator memory.
//!
//! Exactly one backend holds the authoritative copy at any time. Requesting
//! access through [`Buffer::set_owner`] (or any of the typed accessors
//! built on it) lazily allocates the target backend, migrates the current
//! content into it, and — on write intent — marks every other copy stale.
//! Transfers that a backend rejects as too large are bisected and retried
//! automatically.
//!
//! ```
//! use unibuf::emulated::EmulatedDevice;
//! use unibuf::{Access, Backend, Buffer};
//!
//! # fn main() -> unibuf_common::Result<()> {
//! let device = EmulatedDevice::new();
//! let mut buf = Buffer::from_slice(device.env(), b"hello")?;
//!
//! // Migrate to the accelerator for reading; the host copy stays valid.
//! buf.set_owner(Backend::Accel, Access::Read)?;
//! assert_eq!(buf.owner(), Some(Backend::Accel));
//!
//! // Round-trip back through the host view.
//! assert_eq!(buf.as_slice()?, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod backend;
mod buffer;
mod copy;
pub mod emulated;
mod host;
mod stream;

pub use adapter::{AccelMemory, BackendEnv, DevicePtr, QueueToken, SharedHandle, SharedMemory};
pub use backend::{Access, Backend, BackendSet, Hints};
pub use buffer::Buffer;
