//! Key management and backend selection.
//!
//! Two backends exist: [`LegacyBackend`] wraps software keys with an RSA keypair, for devices whose
//! keystore cannot hold AES keys, and [`ModernBackend`] keeps an AES key inside the keystore.
//!
//! The backend of an installation is decided once, at first provisioning, and recorded in the
//! backing store as the legacy capability flag. From then on the flag alone selects the backend:
//! a device provisioned as legacy stays legacy after an OS upgrade, for as long as the flag lives.

use std::sync::{Arc, Mutex};

use crate::config::SecureStorageConfig;
use crate::error::{SecureStorageError, SecureStorageResult};
use crate::persistence::PersistentStore;
use crate::platform::{DeviceCapabilities, HardwareKeystore, HARDWARE_SYMMETRIC_MIN_API_LEVEL};

mod legacy;
mod modern;

pub use legacy::LegacyBackend;
pub use modern::ModernBackend;

/// Store name of the legacy capability flag.
pub const LEGACY_CAPABILITY_FLAG: &str = "INSTALLATION_API_VERSION_UNDER_M";
const LEGACY_CAPABILITY_FLAG_VALUE: &str = "true";

/// The key backend an installation is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// RSA-wrapped AES-CBC + HMAC keys.
    Legacy,
    /// AES key held by the hardware keystore.
    Modern,
}

/// Ciphertext of one value together with the records needed to decrypt it again.
///
/// Backends do not write these records themselves. The caller stores them with the value, so a
/// failed value write cannot leave new records next to an old ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEntry {
    /// Text to store under the entry name.
    pub ciphertext: String,
    /// `(name, content)` pairs to store alongside, e.g. the IV or wrapped entry keys.
    pub records: Vec<(String, String)>,
}

/// Returns `true` if `name` is a store record secure storage keeps for itself.
///
/// These are the capability flag, wrapped legacy keys and IV records. Callers cannot use them as
/// entry names.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    name == LEGACY_CAPABILITY_FLAG
        || legacy::is_wrapped_key_name(name)
        || modern::is_iv_record_name(name)
}

/// Returns `true` if clearing the values of the store must keep `name`.
fn survives_value_clear(name: &str) -> bool {
    name == LEGACY_CAPABILITY_FLAG || legacy::is_installation_key_name(name)
}

/// Operations every key backend provides.
///
/// Ciphertexts are text so they can be written to the backing store as is.
pub trait KeyBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Returns `true` if all key material of this backend is present.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::KeystoreUnavailable`] if the keystore cannot be queried.
    fn key_exists(&self) -> SecureStorageResult<bool>;

    /// Generates the key material of this backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore refuses to generate keys or the store write fails.
    fn generate_key(&self) -> SecureStorageResult<()>;

    /// Encrypts `plaintext` for `entry_key`, creating missing keystore keys on the way.
    ///
    /// # Errors
    ///
    /// Returns an error on keystore, cipher or store failures.
    fn encrypt(&self, entry_key: &str, plaintext: &str) -> SecureStorageResult<SealedEntry>;

    /// Decrypts a ciphertext previously produced by [`KeyBackend::encrypt`] for `entry_key`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::CryptoFailure`] if the ciphertext does not authenticate or
    /// decrypt, and keystore errors if the key is gone.
    fn decrypt(&self, entry_key: &str, ciphertext: &str) -> SecureStorageResult<String>;

    /// Deletes the key material of this backend, including the records that depend on it.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::KeystoreUnavailable`] if the keystore key does not exist.
    fn delete_key(&self) -> SecureStorageResult<()>;

    /// Drops the auxiliary records kept for `entry_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    fn forget_entry(&self, entry_key: &str) -> SecureStorageResult<()>;

    /// Returns `true` if the key lives in a TEE or secure element.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    fn is_key_inside_secure_hardware(&self) -> SecureStorageResult<bool>;
}

/// Selects the backend of the installation and drives the key lifecycle.
pub struct KeyManager {
    store: Arc<PersistentStore>,
    capabilities: Arc<dyn DeviceCapabilities>,
    legacy: LegacyBackend,
    modern: ModernBackend,
    lifecycle: Mutex<()>,
}

impl KeyManager {
    /// Creates a key manager. Nothing is read or written until the first operation.
    #[must_use]
    pub fn new(
        config: Arc<SecureStorageConfig>,
        store: Arc<PersistentStore>,
        keystore: Arc<dyn HardwareKeystore>,
        capabilities: Arc<dyn DeviceCapabilities>,
    ) -> Self {
        Self {
            legacy: LegacyBackend::new(
                Arc::clone(&keystore),
                Arc::clone(&store),
                Arc::clone(&config),
            ),
            modern: ModernBackend::new(keystore, Arc::clone(&store), config),
            store,
            capabilities,
            lifecycle: Mutex::new(()),
        }
    }

    /// Sets the legacy capability flag if this device cannot hold AES keys in hardware and the
    /// flag is not set yet. Never clears the flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn provision_capability_flag(&self) -> SecureStorageResult<()> {
        let api_level = self.capabilities.platform_api_level();
        if api_level < HARDWARE_SYMMETRIC_MIN_API_LEVEL && !self.legacy_flag_present()? {
            log::info!("Provisioning legacy backend (platform API level {api_level})");
            self.set_legacy_flag()?;
        }
        Ok(())
    }

    /// Returns `true` if the legacy capability flag is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn legacy_flag_present(&self) -> SecureStorageResult<bool> {
        self.store.contains(LEGACY_CAPABILITY_FLAG)
    }

    /// Sets the legacy capability flag unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn set_legacy_flag(&self) -> SecureStorageResult<()> {
        self.store.put(LEGACY_CAPABILITY_FLAG, LEGACY_CAPABILITY_FLAG_VALUE)
    }

    /// The backend the installation is pinned to. Derived from the flag only.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn backend_kind(&self) -> SecureStorageResult<BackendKind> {
        Ok(if self.legacy_flag_present()? {
            BackendKind::Legacy
        } else {
            BackendKind::Modern
        })
    }

    fn backend(&self) -> SecureStorageResult<&dyn KeyBackend> {
        Ok(match self.backend_kind()? {
            BackendKind::Legacy => &self.legacy,
            BackendKind::Modern => &self.modern,
        })
    }

    fn lock(&self) -> SecureStorageResult<std::sync::MutexGuard<'_, ()>> {
        self.lifecycle
            .lock()
            .map_err(|_| SecureStorageError::Store("key lifecycle lock poisoned".to_string()))
    }

    /// Generates key material for the active backend if it is absent. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore or the store fails.
    pub fn ensure_keys_exist(&self) -> SecureStorageResult<()> {
        let _guard = self.lock()?;
        let backend = self.backend()?;
        if !backend.key_exists()? {
            log::info!("Generating {} key material", backend.kind());
            backend.generate_key()?;
        }
        Ok(())
    }

    /// Returns `true` if the active backend has all its key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore or the store cannot be queried.
    pub fn key_material_exists(&self) -> SecureStorageResult<bool> {
        self.backend()?.key_exists()
    }

    /// Encrypts `plaintext` for `entry_key`, generating key material first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error on keystore, cipher or store failures.
    pub fn encrypt(&self, entry_key: &str, plaintext: &str) -> SecureStorageResult<SealedEntry> {
        self.ensure_keys_exist()?;
        self.backend()?.encrypt(entry_key, plaintext)
    }

    /// Encrypts `plaintext` and stores it under `entry_key` together with its records.
    ///
    /// On failure the records of a previously stored value are restored.
    ///
    /// # Errors
    ///
    /// Returns an error on keystore, cipher or store failures.
    pub fn seal_into_store(&self, entry_key: &str, plaintext: &str) -> SecureStorageResult<()> {
        let sealed = self.encrypt(entry_key, plaintext)?;
        self.store.put_with_records(entry_key, &sealed.ciphertext, &sealed.records)
    }

    /// Removes every entry and its records, keeping the capability flag and the installation key
    /// material.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear_values(&self) -> SecureStorageResult<()> {
        for name in self.store.keys()? {
            if !survives_value_clear(&name) {
                self.store.remove(&name)?;
            }
        }
        Ok(())
    }

    /// Decrypts the ciphertext stored for `entry_key`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::CryptoFailure`] for ciphertexts that do not authenticate
    /// or decrypt, and keystore errors if the key is gone.
    pub fn decrypt(&self, entry_key: &str, ciphertext: &str) -> SecureStorageResult<String> {
        self.backend()?.decrypt(entry_key, ciphertext)
    }

    /// Deletes the key material of the active backend.
    ///
    /// # Errors
    ///
    /// Fails if the keystore key does not exist; deleting absent keys is treated as misuse.
    pub fn delete_key_material(&self) -> SecureStorageResult<()> {
        let _guard = self.lock()?;
        let backend = self.backend()?;
        log::info!("Deleting {} key material", backend.kind());
        backend.delete_key()
    }

    /// Deletes the key material of the active backend, logging instead of failing.
    ///
    /// Used by a full wipe, which must go on even when the keystore is in a half state.
    pub fn delete_key_material_tolerant(&self) {
        if let Err(err) = self.delete_key_material() {
            log::warn!("Ignoring key deletion failure during wipe: {err}");
        }
    }

    /// Drops the auxiliary records of `entry_key` for the active backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn forget_entry(&self, entry_key: &str) -> SecureStorageResult<()> {
        self.backend()?.forget_entry(entry_key)
    }

    /// Returns `true` if the device can run hardware-only.
    #[must_use]
    pub fn device_qualifies_for_hardware_only(&self) -> bool {
        self.capabilities.has_secure_hardware_support()
    }

    /// Returns `true` if the active key lives in secure hardware. Always `false` for legacy.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    pub fn is_key_inside_secure_hardware(&self) -> SecureStorageResult<bool> {
        self.backend()?.is_key_inside_secure_hardware()
    }
}
