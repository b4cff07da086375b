//! Core definitions (error type, result alias, contract-check macros),
//! relied upon by all unibuf-* crates.

pub mod error;
pub mod result;

pub use result::Result;
