//! In-memory implementations of the platform traits.
//!
//! These implementations are NOT secure for production use: "hardware" keys live in process
//! memory. They do run real RSA and AES so the envelope logic above them is exercised end to
//! end, and they can simulate a missing keystore or a device without secure hardware.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::{rngs::OsRng, RngCore};
use rsa::{pkcs8::EncodePublicKey, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use crate::error::{SecureStorageError, SecureStorageResult};

use super::{
    Certificate, DeviceCapabilities, HardwareKeystore, KeyPairSpec, KeyValueStore,
    PrivateKeyHandle, SealedData, SecretKeyHandle, SecretKeySpec, StoreChangeListener,
    HARDWARE_SYMMETRIC_MIN_API_LEVEL,
};

const AES_256_KEY_BITS: u32 = 256;
const AES_BLOCK_SIZE: usize = 16;

// =============================================================================
// Memory Keystore
// =============================================================================

enum MemoryEntry {
    KeyPair {
        private_key: RsaPrivateKey,
        certificate: Certificate,
    },
    Secret(Arc<MemorySecretKey>),
}

/// In-memory keystore.
///
/// **FOR TESTING ONLY.**
pub struct MemoryKeystore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    secure_hardware: bool,
    rsa_key_size: Option<u32>,
    available: AtomicBool,
}

impl MemoryKeystore {
    /// Creates an empty keystore that reports its keys as hardware backed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            secure_hardware: true,
            rsa_key_size: None,
            available: AtomicBool::new(true),
        }
    }

    /// Creates an empty keystore of a device without TEE/SE.
    ///
    /// Keys report `is_inside_secure_hardware() == false` and `StrongBox` requests fail.
    #[must_use]
    pub fn without_secure_hardware() -> Self {
        Self {
            secure_hardware: false,
            ..Self::new()
        }
    }

    /// Overrides the RSA modulus size requested by callers, to keep test key generation fast.
    #[must_use]
    pub fn with_rsa_key_size(mut self, bits: u32) -> Self {
        self.rsa_key_size = Some(bits);
        self
    }

    /// Makes every subsequent operation fail as if the keystore could not be loaded.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the aliases currently stored.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        aliases.sort();
        aliases
    }

    fn check_available(&self) -> SecureStorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SecureStorageError::KeystoreUnavailable(
                "keystore could not be loaded".to_string(),
            ))
        }
    }

    fn with_entry<T>(
        &self,
        alias: &str,
        f: impl FnOnce(Option<&MemoryEntry>) -> T,
    ) -> SecureStorageResult<T> {
        self.check_available()?;
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(f(entries.get(alias)))
    }

    fn insert(&self, alias: String, entry: MemoryEntry) -> SecureStorageResult<()> {
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(alias, entry);
        Ok(())
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareKeystore for MemoryKeystore {
    fn load(&self) -> SecureStorageResult<()> {
        self.check_available()
    }

    fn private_key(&self, alias: String) -> SecureStorageResult<Option<Arc<dyn PrivateKeyHandle>>> {
        self.with_entry(&alias, |entry| match entry {
            Some(MemoryEntry::KeyPair { private_key, .. }) => {
                Some(Arc::new(MemoryPrivateKey(private_key.clone())) as Arc<dyn PrivateKeyHandle>)
            }
            _ => None,
        })
    }

    fn certificate(&self, alias: String) -> SecureStorageResult<Option<Certificate>> {
        self.with_entry(&alias, |entry| match entry {
            Some(MemoryEntry::KeyPair { certificate, .. }) => Some(certificate.clone()),
            _ => None,
        })
    }

    fn secret_key(&self, alias: String) -> SecureStorageResult<Option<Arc<dyn SecretKeyHandle>>> {
        self.with_entry(&alias, |entry| match entry {
            Some(MemoryEntry::Secret(key)) => Some(Arc::clone(key) as Arc<dyn SecretKeyHandle>),
            _ => None,
        })
    }

    fn contains_alias(&self, alias: String) -> SecureStorageResult<bool> {
        self.with_entry(&alias, |entry| entry.is_some())
    }

    fn delete_entry(&self, alias: String) -> SecureStorageResult<()> {
        self.check_available()?;
        self.entries.write().map_err(|_| poisoned())?.remove(&alias);
        Ok(())
    }

    fn generate_key_pair(&self, spec: KeyPairSpec) -> SecureStorageResult<()> {
        self.check_available()?;
        let bits = self.rsa_key_size.unwrap_or(spec.key_size);
        let private_key = RsaPrivateKey::new(&mut OsRng, bits as usize)
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))?;
        let public_key_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))?
            .as_bytes()
            .to_vec();
        let certificate = Certificate {
            subject: spec.subject,
            serial_number: spec.serial_number,
            not_before: spec.not_before,
            not_after: spec.not_after,
            public_key_der,
        };
        self.insert(
            spec.alias,
            MemoryEntry::KeyPair {
                private_key,
                certificate,
            },
        )
    }

    fn generate_secret_key(
        &self,
        spec: SecretKeySpec,
    ) -> SecureStorageResult<Arc<dyn SecretKeyHandle>> {
        self.check_available()?;
        if spec.strongbox_backed && !self.secure_hardware {
            return Err(SecureStorageError::KeystoreUnavailable(
                "StrongBox is not available on this device".to_string(),
            ));
        }
        if spec.key_size != AES_256_KEY_BITS {
            return Err(SecureStorageError::CryptoFailure(format!(
                "unsupported AES key size: {}",
                spec.key_size
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut key[..]);
        let handle = Arc::new(MemorySecretKey {
            key,
            inside_secure_hardware: self.secure_hardware,
        });
        self.insert(spec.alias, MemoryEntry::Secret(Arc::clone(&handle)))?;
        Ok(handle)
    }
}

struct MemoryPrivateKey(RsaPrivateKey);

impl PrivateKeyHandle for MemoryPrivateKey {
    fn decrypt(&self, ciphertext: Vec<u8>) -> SecureStorageResult<Vec<u8>> {
        self.0
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))
    }
}

struct MemorySecretKey {
    key: Zeroizing<[u8; 32]>,
    inside_secure_hardware: bool,
}

impl SecretKeyHandle for MemorySecretKey {
    fn encrypt(&self, plaintext: Vec<u8>) -> SecureStorageResult<SealedData> {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = cbc::Encryptor::<Aes256>::new_from_slices(&self.key[..], &iv)
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
        Ok(SealedData {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    fn decrypt(&self, iv: Vec<u8>, ciphertext: Vec<u8>) -> SecureStorageResult<Vec<u8>> {
        cbc::Decryptor::<Aes256>::new_from_slices(&self.key[..], &iv)
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|err| SecureStorageError::CryptoFailure(err.to_string()))
    }

    fn is_inside_secure_hardware(&self) -> bool {
        self.inside_secure_hardware
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory key-value store backed by a `BTreeMap`, with change notification.
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    listeners: Mutex<Vec<Arc<dyn StoreChangeListener>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, name: Option<&str>) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_store_changed(name.map(str::to_string));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, name: String, value: String) -> SecureStorageResult<()> {
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(name.clone(), value);
        self.notify(Some(&name));
        Ok(())
    }

    fn get(&self, name: String) -> SecureStorageResult<Option<String>> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(&name).cloned())
    }

    fn remove(&self, name: String) -> SecureStorageResult<()> {
        let removed = self
            .entries
            .write()
            .map_err(|_| poisoned())?
            .remove(&name)
            .is_some();
        if removed {
            self.notify(Some(&name));
        }
        Ok(())
    }

    fn clear(&self) -> SecureStorageResult<()> {
        self.entries.write().map_err(|_| poisoned())?.clear();
        self.notify(None);
        Ok(())
    }

    fn contains(&self, name: String) -> SecureStorageResult<bool> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .contains_key(&name))
    }

    fn keys(&self) -> SecureStorageResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect())
    }

    fn register_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    fn unregister_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|registered| !Arc::ptr_eq(registered, &listener));
        }
    }
}

// =============================================================================
// Memory Capabilities
// =============================================================================

/// Fixed device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCapabilities {
    api_level: u32,
    secure_hardware: bool,
}

impl MemoryCapabilities {
    /// Creates capabilities with the given API level and secure hardware support.
    #[must_use]
    pub const fn new(api_level: u32, secure_hardware: bool) -> Self {
        Self {
            api_level,
            secure_hardware,
        }
    }

    /// A device below [`HARDWARE_SYMMETRIC_MIN_API_LEVEL`] without secure hardware.
    #[must_use]
    pub const fn legacy_device() -> Self {
        Self::new(HARDWARE_SYMMETRIC_MIN_API_LEVEL - 2, false)
    }

    /// A current device with secure hardware.
    #[must_use]
    pub const fn modern_device() -> Self {
        Self::new(28, true)
    }
}

impl DeviceCapabilities for MemoryCapabilities {
    fn has_secure_hardware_support(&self) -> bool {
        self.secure_hardware
    }

    fn platform_api_level(&self) -> u32 {
        self.api_level
    }
}

fn poisoned() -> SecureStorageError {
    SecureStorageError::Store("mutex poisoned".to_string())
}
