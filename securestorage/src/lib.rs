//! Distribution crate for `SecureStorage`.
//!
//! Mobile applications link this crate; it re-exports [`securestorage_core`] together with its
//! `UniFFI` scaffolding so a single shared library carries the whole foreign API.

pub use securestorage_core::*;

securestorage_core::uniffi_reexport_scaffolding!();
