//! Typed encrypted key-value storage.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::SecureStorageConfig;
use crate::error::{SecureStorageError, SecureStorageResult};
use crate::keys::{is_reserved_name, BackendKind, KeyManager};
use crate::persistence::PersistentStore;
use crate::platform::{DeviceCapabilities, HardwareKeystore, KeyValueStore, StoreChangeListener};

/// Encrypted key-value storage bound to the device keystore.
///
/// Values of every type are stored as the ciphertext of their string form. Reads never fail on a
/// missing or unreadable value; they return the supplied default instead. Writes report every
/// failure.
///
/// Entry names must not collide with the records kept next to the values (the capability flag,
/// wrapped keys and IV records); such names fail with [`SecureStorageError::ReservedName`].
///
/// All operations that touch values or key material are serialized.
#[derive(uniffi::Object)]
pub struct SecureStorage {
    config: Arc<SecureStorageConfig>,
    store: Arc<PersistentStore>,
    keys: KeyManager,
    hardware_supported: bool,
    usable: bool,
    lock: Mutex<()>,
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage")
            .field("namespace", &self.config.namespace)
            .field("usable", &self.usable)
            .finish_non_exhaustive()
    }
}

#[uniffi::export]
impl SecureStorage {
    /// Initializes secure storage.
    ///
    /// `store` must be the backing store the host opened for `config.namespace`.
    ///
    /// On first use this pins the installation to a backend and generates key material. If
    /// `config.require_hardware_only` is set and the device has no secure hardware, the instance
    /// is created inert: every data operation fails with
    /// [`SecureStorageError::HardwareUnsupported`].
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, or if provisioning keys fails.
    #[uniffi::constructor]
    pub fn new(
        config: SecureStorageConfig,
        store: Arc<dyn KeyValueStore>,
        keystore: Arc<dyn HardwareKeystore>,
        capabilities: Arc<dyn DeviceCapabilities>,
    ) -> SecureStorageResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = Arc::new(PersistentStore::new(store, config.persistence_mode())?);
        let keys = KeyManager::new(
            Arc::clone(&config),
            Arc::clone(&store),
            keystore,
            capabilities,
        );
        let hardware_supported = keys.device_qualifies_for_hardware_only();
        let usable = !config.require_hardware_only || hardware_supported;

        if usable {
            keys.provision_capability_flag()?;
            keys.ensure_keys_exist()?;
            log::info!(
                "Secure storage {} ready ({} backend, {} persistence)",
                config.namespace,
                keys.backend_kind()?,
                store.mode()
            );
        } else {
            log::warn!(
                "Secure storage {} disabled: hardware-only requested without secure hardware",
                config.namespace
            );
        }

        Ok(Self {
            config,
            store,
            keys,
            hardware_supported,
            usable,
            lock: Mutex::new(()),
        })
    }

    /// Encrypts and stores a string.
    ///
    /// If the write fails, a value previously stored under `key` stays readable.
    ///
    /// # Errors
    ///
    /// Returns an error for a reserved name, or if key generation, encryption or the store write
    /// fails.
    pub fn put_string(&self, key: &str, value: &str) -> SecureStorageResult<()> {
        self.ensure_entry_name(key)?;
        let _guard = self.lock()?;
        self.keys.seal_into_store(key, value)
    }

    /// Encrypts and stores a boolean.
    ///
    /// # Errors
    ///
    /// See [`SecureStorage::put_string`].
    pub fn put_bool(&self, key: &str, value: bool) -> SecureStorageResult<()> {
        self.put_string(key, &value.to_string())
    }

    /// Encrypts and stores a 32-bit integer.
    ///
    /// # Errors
    ///
    /// See [`SecureStorage::put_string`].
    pub fn put_int(&self, key: &str, value: i32) -> SecureStorageResult<()> {
        self.put_string(key, &value.to_string())
    }

    /// Encrypts and stores a 64-bit integer.
    ///
    /// # Errors
    ///
    /// See [`SecureStorage::put_string`].
    pub fn put_long(&self, key: &str, value: i64) -> SecureStorageResult<()> {
        self.put_string(key, &value.to_string())
    }

    /// Encrypts and stores a 32-bit float. The value reads back bit for bit.
    ///
    /// # Errors
    ///
    /// See [`SecureStorage::put_string`].
    pub fn put_float(&self, key: &str, value: f32) -> SecureStorageResult<()> {
        self.put_string(key, &value.to_string())
    }

    /// Encrypts and stores a 64-bit float. The value reads back bit for bit.
    ///
    /// # Errors
    ///
    /// See [`SecureStorage::put_string`].
    pub fn put_double(&self, key: &str, value: f64) -> SecureStorageResult<()> {
        self.put_string(key, &value.to_string())
    }

    /// Reads and decrypts a string, or returns `default` if it is absent or unreadable.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_string(&self, key: &str, default: String) -> SecureStorageResult<String> {
        Ok(self.read(key)?.unwrap_or(default))
    }

    /// Reads a boolean, or returns `default`.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_bool(&self, key: &str, default: bool) -> SecureStorageResult<bool> {
        self.read_parsed(key, default)
    }

    /// Reads a 32-bit integer, or returns `default`.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_int(&self, key: &str, default: i32) -> SecureStorageResult<i32> {
        self.read_parsed(key, default)
    }

    /// Reads a 64-bit integer, or returns `default`.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_long(&self, key: &str, default: i64) -> SecureStorageResult<i64> {
        self.read_parsed(key, default)
    }

    /// Reads a 32-bit float, or returns `default`.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_float(&self, key: &str, default: f32) -> SecureStorageResult<f32> {
        self.read_parsed(key, default)
    }

    /// Reads a 64-bit float, or returns `default`.
    ///
    /// # Errors
    ///
    /// Only [`SecureStorageError::HardwareUnsupported`] and [`SecureStorageError::ReservedName`].
    pub fn get_double(&self, key: &str, default: f64) -> SecureStorageResult<f64> {
        self.read_parsed(key, default)
    }

    /// Returns `true` if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for a reserved name, or if the store cannot be read.
    pub fn contains(&self, key: &str) -> SecureStorageResult<bool> {
        self.ensure_entry_name(key)?;
        let _guard = self.lock()?;
        self.store.contains(key)
    }

    /// Removes the value stored under `key` and its auxiliary records.
    ///
    /// # Errors
    ///
    /// Returns an error for a reserved name, or if the store write fails.
    pub fn remove(&self, key: &str) -> SecureStorageResult<()> {
        self.ensure_entry_name(key)?;
        let _guard = self.lock()?;
        self.store.remove(key)?;
        self.keys.forget_entry(key)
    }

    /// Removes every stored value. Key material and the backend pinning are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear_all_values(&self) -> SecureStorageResult<()> {
        self.ensure_usable()?;
        let _guard = self.lock()?;
        self.keys.clear_values()
    }

    /// Removes every stored value and deletes the key material.
    ///
    /// Failures to delete keys are logged and do not stop the wipe. The next write generates
    /// fresh key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be cleared.
    pub fn clear_all_values_and_delete_keys(&self) -> SecureStorageResult<()> {
        self.ensure_usable()?;
        let _guard = self.lock()?;
        match self.keys.key_material_exists() {
            Ok(false) => log::debug!("No key material to delete"),
            Ok(true) => self.keys.delete_key_material_tolerant(),
            Err(err) => {
                log::warn!("Could not check key material before wipe: {err}");
                self.keys.delete_key_material_tolerant();
            }
        }
        self.store.clear()?;
        self.keys.provision_capability_flag()
    }

    /// Registers a listener on the backing store.
    ///
    /// Listeners may be invoked while secure storage holds its lock and must not call back into
    /// this instance synchronously.
    pub fn register_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.store.register_change_listener(listener);
    }

    /// Unregisters a listener from the backing store.
    pub fn unregister_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.store.unregister_change_listener(listener);
    }

    /// Returns `true` if the key material of the active backend exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore or the store cannot be queried.
    pub fn key_material_exists(&self) -> SecureStorageResult<bool> {
        self.ensure_usable()?;
        let _guard = self.lock()?;
        self.keys.key_material_exists()
    }

    /// The backend this installation is pinned to.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn backend(&self) -> SecureStorageResult<BackendKind> {
        self.ensure_usable()?;
        self.keys.backend_kind()
    }

    /// Returns `true` if the encryption key lives in a TEE or secure element.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    pub fn is_key_inside_secure_hardware(&self) -> SecureStorageResult<bool> {
        self.ensure_usable()?;
        self.keys.is_key_inside_secure_hardware()
    }

    /// Returns `true` if the device has secure hardware (TEE or SE) for keys.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::HardwareUnsupported`] on an inert instance.
    pub fn device_has_secure_hardware_support(&self) -> SecureStorageResult<bool> {
        self.ensure_usable()?;
        Ok(self.hardware_supported)
    }

    /// Blocks until deferred writes have reached the backing store.
    ///
    /// # Errors
    ///
    /// Returns an error if the background writer is gone.
    pub fn flush(&self) -> SecureStorageResult<()> {
        self.store.flush()
    }
}

/// Implementation not exposed to foreign bindings
impl SecureStorage {
    /// The configuration this instance was created with.
    #[must_use]
    pub fn config(&self) -> &SecureStorageConfig {
        &self.config
    }

    /// Returns `false` if the instance is inert because hardware-only was requested.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.usable
    }

    const fn ensure_usable(&self) -> SecureStorageResult<()> {
        if self.usable {
            Ok(())
        } else {
            Err(SecureStorageError::HardwareUnsupported)
        }
    }

    fn ensure_entry_name(&self, key: &str) -> SecureStorageResult<()> {
        self.ensure_usable()?;
        if is_reserved_name(key) {
            return Err(SecureStorageError::ReservedName(key.to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> SecureStorageResult<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| SecureStorageError::Store("secure storage mutex poisoned".to_string()))
    }

    /// Decrypted value of `key`, or `None` if it is absent or cannot be read.
    fn read(&self, key: &str) -> SecureStorageResult<Option<String>> {
        self.ensure_entry_name(key)?;
        match self.try_read(key) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::warn!("Returning default for {key}: {err}");
                Ok(None)
            }
        }
    }

    fn try_read(&self, key: &str) -> SecureStorageResult<Option<String>> {
        let _guard = self.lock()?;
        let Some(ciphertext) = self.store.get(key)? else {
            return Ok(None);
        };
        self.keys.decrypt(key, &ciphertext).map(Some)
    }

    fn read_parsed<T: FromStr>(&self, key: &str, default: T) -> SecureStorageResult<T> {
        Ok(self
            .read(key)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(default))
    }
}
