//! Common test utilities shared across integration tests.
#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use securestorage_core::platform::{
    KeyValueStore, MemoryCapabilities, MemoryKeystore, MemoryStore, StoreChangeListener,
};
use securestorage_core::{
    SecureStorage, SecureStorageConfig, SecureStorageError, SecureStorageResult,
};
use uuid::Uuid;

/// Keystore and preferences of one simulated device. Survive "app restarts" and OS upgrades.
pub struct Device {
    pub keystore: Arc<MemoryKeystore>,
    pub store: Arc<MemoryStore>,
    pub namespace: String,
}

impl Device {
    pub fn new() -> Self {
        Self::with_keystore(MemoryKeystore::new())
    }

    #[allow(dead_code, reason = "used in tests")]
    pub fn without_secure_hardware() -> Self {
        Self::with_keystore(MemoryKeystore::without_secure_hardware())
    }

    fn with_keystore(keystore: MemoryKeystore) -> Self {
        Self {
            keystore: Arc::new(keystore.with_rsa_key_size(1024)),
            store: Arc::new(MemoryStore::new()),
            namespace: format!("securestorage-test-{}", Uuid::new_v4()),
        }
    }

    pub fn config(&self) -> SecureStorageConfig {
        SecureStorageConfig::new(self.namespace.clone())
    }

    /// Initializes secure storage on this device.
    pub fn open(&self, capabilities: MemoryCapabilities) -> SecureStorage {
        self.open_with(self.config(), capabilities)
    }

    pub fn open_with(
        &self,
        config: SecureStorageConfig,
        capabilities: MemoryCapabilities,
    ) -> SecureStorage {
        SecureStorage::new(
            config,
            self.store.clone(),
            self.keystore.clone(),
            Arc::new(capabilities),
        )
        .expect("init secure storage")
    }

    /// Initializes secure storage on this device's keystore with another backing store.
    #[allow(dead_code, reason = "used in tests")]
    pub fn open_on(
        &self,
        store: Arc<dyn KeyValueStore>,
        capabilities: MemoryCapabilities,
    ) -> SecureStorage {
        SecureStorage::new(
            self.config(),
            store,
            self.keystore.clone(),
            Arc::new(capabilities),
        )
        .expect("init secure storage")
    }

    /// Raw value in the backing store.
    #[allow(dead_code, reason = "used in tests")]
    pub fn raw(&self, name: &str) -> Option<String> {
        self.store.get(name.to_string()).expect("read backing store")
    }

    #[allow(dead_code, reason = "used in tests")]
    pub fn set_raw(&self, name: &str, value: &str) {
        self.store
            .put(name.to_string(), value.to_string())
            .expect("write backing store");
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// Records every change notification.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Option<String>>>,
}

impl RecordingListener {
    #[allow(dead_code, reason = "used in tests")]
    pub fn events(&self) -> Vec<Option<String>> {
        self.events.lock().expect("listener mutex").clone()
    }
}

impl StoreChangeListener for RecordingListener {
    fn on_store_changed(&self, name: Option<String>) {
        self.events.lock().expect("listener mutex").push(name);
    }
}

/// Backing store that refuses writes to one name while failing is switched on.
#[allow(dead_code, reason = "used in tests")]
pub struct FlakyStore {
    inner: MemoryStore,
    name: String,
    failing: AtomicBool,
}

#[allow(dead_code, reason = "used in tests")]
impl FlakyStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            name: name.to_string(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn refuses(&self, name: &str) -> bool {
        self.failing.load(Ordering::SeqCst) && name == self.name
    }
}

impl KeyValueStore for FlakyStore {
    fn put(&self, name: String, value: String) -> SecureStorageResult<()> {
        if self.refuses(&name) {
            return Err(SecureStorageError::Store(format!("disk full writing {name}")));
        }
        self.inner.put(name, value)
    }

    fn get(&self, name: String) -> SecureStorageResult<Option<String>> {
        self.inner.get(name)
    }

    fn remove(&self, name: String) -> SecureStorageResult<()> {
        self.inner.remove(name)
    }

    fn clear(&self) -> SecureStorageResult<()> {
        self.inner.clear()
    }

    fn contains(&self, name: String) -> SecureStorageResult<bool> {
        self.inner.contains(name)
    }

    fn keys(&self) -> SecureStorageResult<Vec<String>> {
        self.inner.keys()
    }

    fn register_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.inner.register_change_listener(listener);
    }

    fn unregister_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.inner.unregister_change_listener(listener);
    }
}
