//! `securestorage-core` encrypts small typed values at rest under a key bound to the device
//! keystore.
//!
//! Devices whose keystore can hold AES keys use them directly. Older devices get an RSA keypair
//! in the keystore that wraps software AES and HMAC keys. Which of the two an installation uses
//! is decided once and then pinned, see [`keys`].
//!
//! The host app provides the backing store, the keystore and a capability probe through the
//! traits in [`platform`], and talks to [`SecureStorage`].

#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod config;
pub use config::*;

mod error;
pub use error::*;

mod secure_storage;
pub use secure_storage::SecureStorage;

/// Authenticated encryption and key validity helpers.
pub mod crypto;

pub mod keys;
pub use keys::{BackendKind, KeyManager, LEGACY_CAPABILITY_FLAG};

/// Forwarding of library logs to the host platform.
pub mod logger;

pub mod persistence;
pub use persistence::{PersistenceMode, PersistentStore};

pub mod platform;

uniffi::setup_scaffolding!("securestorage_core");
