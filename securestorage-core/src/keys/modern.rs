//! Hardware-symmetric backend.
//!
//! An AES-256 key is generated inside the keystore and never leaves it. Each value is encrypted
//! with a fresh IV chosen by the keystore; the IV is handed back as a record to persist next to
//! the value under `KeyCipherIV<entry>`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};

use super::{BackendKind, KeyBackend, SealedEntry};
use crate::config::SecureStorageConfig;
use crate::crypto::ValidityWindow;
use crate::error::{SecureStorageError, SecureStorageResult};
use crate::persistence::PersistentStore;
use crate::platform::{
    BlockMode, EncryptionPadding, HardwareKeystore, KeyPurpose, SecretKeyHandle, SecretKeySpec,
};

/// AES key size of the hardware key.
pub const AES_KEY_SIZE: u32 = 256;

const IV_RECORD_PREFIX: &str = "KeyCipherIV";

fn iv_record_name(entry_key: &str) -> String {
    format!("{IV_RECORD_PREFIX}{entry_key}")
}

pub(super) fn is_iv_record_name(name: &str) -> bool {
    name.starts_with(IV_RECORD_PREFIX)
}

/// Keystore-held AES-CBC backend.
pub struct ModernBackend {
    keystore: Arc<dyn HardwareKeystore>,
    store: Arc<PersistentStore>,
    config: Arc<SecureStorageConfig>,
}

impl ModernBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new(
        keystore: Arc<dyn HardwareKeystore>,
        store: Arc<PersistentStore>,
        config: Arc<SecureStorageConfig>,
    ) -> Self {
        Self {
            keystore,
            store,
            config,
        }
    }

    fn alias(&self) -> String {
        self.config.key_alias.clone()
    }

    fn key_spec(&self) -> SecretKeySpec {
        let hardware_only = self.config.require_hardware_only;
        SecretKeySpec {
            alias: self.alias(),
            key_size: AES_KEY_SIZE,
            purposes: vec![KeyPurpose::Encrypt, KeyPurpose::Decrypt],
            block_mode: BlockMode::Cbc,
            padding: EncryptionPadding::Pkcs7,
            not_before: ValidityWindow::now().not_before_system_time(),
            strongbox_backed: hardware_only,
            user_confirmation_required: hardware_only,
        }
    }

    fn create_key(&self) -> SecureStorageResult<Arc<dyn SecretKeyHandle>> {
        log::debug!(
            "Generating AES-{AES_KEY_SIZE} key (hardware only: {})",
            self.config.require_hardware_only
        );
        self.keystore.generate_secret_key(self.key_spec())
    }

    fn secret_key(&self) -> SecureStorageResult<Arc<dyn SecretKeyHandle>> {
        self.keystore.secret_key(self.alias())?.ok_or_else(|| {
            SecureStorageError::KeyMaterialMissing(format!(
                "secret key {} not found",
                self.config.key_alias
            ))
        })
    }

    fn purge_iv_records(&self) -> SecureStorageResult<()> {
        for name in self.store.keys()? {
            if is_iv_record_name(&name) {
                self.store.remove(&name)?;
            }
        }
        Ok(())
    }
}

impl KeyBackend for ModernBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Modern
    }

    fn key_exists(&self) -> SecureStorageResult<bool> {
        self.keystore.load()?;
        Ok(self.keystore.secret_key(self.alias())?.is_some())
    }

    fn generate_key(&self) -> SecureStorageResult<()> {
        self.keystore.load()?;
        self.create_key().map(|_| ())
    }

    fn encrypt(&self, entry_key: &str, plaintext: &str) -> SecureStorageResult<SealedEntry> {
        self.keystore.load()?;
        let key = match self.keystore.secret_key(self.alias())? {
            Some(key) => key,
            None => self.create_key()?,
        };
        let sealed = key.encrypt(plaintext.as_bytes().to_vec())?;
        Ok(SealedEntry {
            ciphertext: STANDARD.encode(&sealed.ciphertext),
            records: vec![(iv_record_name(entry_key), STANDARD.encode(&sealed.iv))],
        })
    }

    fn decrypt(&self, entry_key: &str, ciphertext: &str) -> SecureStorageResult<String> {
        self.keystore.load()?;
        let key = self.secret_key()?;
        let iv = self
            .store
            .get(&iv_record_name(entry_key))?
            .ok_or_else(|| {
                SecureStorageError::CryptoFailure(format!("no IV stored for {entry_key}"))
            })?;
        let iv = STANDARD
            .decode(iv)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("iv: {err}")))?;
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("ciphertext: {err}")))?;
        let plaintext = key.decrypt(iv, ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("plaintext: {err}")))
    }

    fn delete_key(&self) -> SecureStorageResult<()> {
        self.keystore.load()?;
        if !self.keystore.contains_alias(self.alias())? {
            return Err(SecureStorageError::KeystoreUnavailable(
                "Key does not exist".to_string(),
            ));
        }
        self.keystore.delete_entry(self.alias())?;
        self.purge_iv_records()
    }

    fn forget_entry(&self, entry_key: &str) -> SecureStorageResult<()> {
        self.store.remove(&iv_record_name(entry_key))
    }

    fn is_key_inside_secure_hardware(&self) -> SecureStorageResult<bool> {
        self.keystore.load()?;
        Ok(self
            .keystore
            .secret_key(self.alias())?
            .is_some_and(|key| key.is_inside_secure_hardware()))
    }
}
