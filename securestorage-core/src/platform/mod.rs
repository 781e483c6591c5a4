//! Platform abstraction traits for secure storage.
//!
//! Secure storage never talks to Android or iOS APIs directly. Everything platform specific
//! is provided by the host through these traits:
//!
//! - [`KeyValueStore`]: durable string map the encrypted entries are written to
//!   (`SharedPreferences`, `UserDefaults`, a file, ...)
//! - [`HardwareKeystore`]: the native keystore that generates and holds keys
//!   (Android Keystore, Keychain/Secure Enclave)
//! - [`PrivateKeyHandle`] / [`SecretKeyHandle`]: opaque handles to keys inside the keystore;
//!   raw key bytes never cross this boundary
//! - [`DeviceCapabilities`]: secure hardware probe and platform API level
//!
//! ## Android (Kotlin)
//! - `KeyValueStore`: `SharedPreferences` in `MODE_PRIVATE`
//! - `HardwareKeystore`: `AndroidKeyStore` provider
//!   (`KeyPairGeneratorSpec` / `KeyGenParameterSpec`)
//! - `DeviceCapabilities`: `Build.VERSION.SDK_INT` plus the fingerprint HAL / TEE probe
//!
//! [`memory`] holds in-process implementations for tests.

mod capabilities;
mod keystore;
pub mod memory;
mod store;

pub use capabilities::{DeviceCapabilities, HARDWARE_SYMMETRIC_MIN_API_LEVEL};
pub use keystore::{
    BlockMode, Certificate, EncryptionPadding, HardwareKeystore, KeyPairSpec, KeyPurpose,
    PrivateKeyHandle, SealedData, SecretKeyHandle, SecretKeySpec,
};
pub use store::{KeyValueStore, StoreChangeListener};

pub use memory::{MemoryCapabilities, MemoryKeystore, MemoryStore};
