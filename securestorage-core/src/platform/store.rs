//! Backing key-value store interface.

use std::sync::Arc;

use crate::error::SecureStorageResult;

/// Durable string map that secure storage persists into.
///
/// The store is trusted for durability, not for confidentiality: everything secure storage
/// writes here is either ciphertext, a wrapped key, an IV or the capability flag. Binary data
/// is Base64 encoded by the caller before it reaches the store.
///
/// Implementations must be safe to call from several threads.
#[uniffi::export(with_foreign)]
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` under `name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, name: String, value: String) -> SecureStorageResult<()>;

    /// Reads the value stored under `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get(&self, name: String) -> SecureStorageResult<Option<String>>;

    /// Removes `name`. Removing an absent name is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove(&self, name: String) -> SecureStorageResult<()>;

    /// Removes every entry of the namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn clear(&self) -> SecureStorageResult<()>;

    /// Returns `true` if a value is stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn contains(&self, name: String) -> SecureStorageResult<bool>;

    /// Lists all names currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn keys(&self) -> SecureStorageResult<Vec<String>>;

    /// Registers a listener notified after every add, update, remove or clear.
    fn register_change_listener(&self, listener: Arc<dyn StoreChangeListener>);

    /// Unregisters a listener previously passed to `register_change_listener`.
    fn unregister_change_listener(&self, listener: Arc<dyn StoreChangeListener>);
}

/// Observer of changes in a [`KeyValueStore`].
#[uniffi::export(with_foreign)]
pub trait StoreChangeListener: Send + Sync {
    /// Called after `name` was added, updated or removed; `None` after a clear.
    fn on_store_changed(&self, name: Option<String>);
}
