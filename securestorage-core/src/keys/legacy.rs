//! Wrapped-symmetric backend for devices without hardware AES keys.
//!
//! The keystore holds an RSA keypair. Symmetric keys (AES confidentiality key and HMAC
//! integrity key) are generated in software, encrypted under the RSA public key and persisted
//! as Base64 blobs. Values are sealed with [`crate::crypto::aes_cbc_hmac`].
//!
//! Layout in the backing store:
//!
//! - `AesConfidentialityKey` / `AesIntegrityKey`: the installation key pair, written when the
//!   key material is generated. Its presence is part of [`KeyBackend::key_exists`].
//! - `confidentiality-key-<entry>` / `integrity-key-<entry>`: the key pair sealing `<entry>`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Encrypt, RsaPublicKey};
use zeroize::Zeroizing;

use super::{BackendKind, KeyBackend, SealedEntry};
use crate::config::SecureStorageConfig;
use crate::crypto::{
    aes_cbc_hmac, CipherTextIvMac, SecretKeys, ValidityWindow, CONFIDENTIALITY_KEY_SIZE,
    INTEGRITY_KEY_SIZE,
};
use crate::error::{SecureStorageError, SecureStorageResult};
use crate::persistence::PersistentStore;
use crate::platform::{HardwareKeystore, KeyPairSpec};

/// RSA modulus size of the wrapping keypair.
pub const RSA_KEY_SIZE: u32 = 2048;
/// Serial number of the self-signed certificate.
pub const CERTIFICATE_SERIAL_NUMBER: u64 = 10;

const INSTALLATION_CONFIDENTIALITY_KEY: &str = "AesConfidentialityKey";
const INSTALLATION_INTEGRITY_KEY: &str = "AesIntegrityKey";
const ENTRY_CONFIDENTIALITY_PREFIX: &str = "confidentiality-key-";
const ENTRY_INTEGRITY_PREFIX: &str = "integrity-key-";

/// Store names of the wrapped key pair of one entry.
fn entry_key_names(entry_key: &str) -> (String, String) {
    (
        format!("{ENTRY_CONFIDENTIALITY_PREFIX}{entry_key}"),
        format!("{ENTRY_INTEGRITY_PREFIX}{entry_key}"),
    )
}

pub(super) fn is_installation_key_name(name: &str) -> bool {
    name == INSTALLATION_CONFIDENTIALITY_KEY || name == INSTALLATION_INTEGRITY_KEY
}

pub(super) fn is_wrapped_key_name(name: &str) -> bool {
    is_installation_key_name(name)
        || name.starts_with(ENTRY_CONFIDENTIALITY_PREFIX)
        || name.starts_with(ENTRY_INTEGRITY_PREFIX)
}

/// RSA-wrapped AES-CBC + HMAC backend.
pub struct LegacyBackend {
    keystore: Arc<dyn HardwareKeystore>,
    store: Arc<PersistentStore>,
    config: Arc<SecureStorageConfig>,
}

impl LegacyBackend {
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

    fn key_pair_exists(&self) -> SecureStorageResult<bool> {
        Ok(self.keystore.certificate(self.alias())?.is_some()
            && self.keystore.private_key(self.alias())?.is_some())
    }

    fn generate_key_pair(&self) -> SecureStorageResult<()> {
        let window = ValidityWindow::now();
        log::debug!(
            "Generating {RSA_KEY_SIZE}-bit RSA keypair, valid {}",
            window.describe()
        );
        self.keystore.generate_key_pair(KeyPairSpec {
            alias: self.alias(),
            subject: self.config.subject_dn.clone(),
            serial_number: CERTIFICATE_SERIAL_NUMBER,
            key_size: RSA_KEY_SIZE,
            not_before: window.not_before_system_time(),
            not_after: window.not_after_system_time(),
        })
    }

    /// Removes every wrapped key blob from the store.
    fn purge_wrapped_keys(&self) -> SecureStorageResult<()> {
        for name in self.store.keys()? {
            if is_wrapped_key_name(&name) {
                self.store.remove(&name)?;
            }
        }
        Ok(())
    }

    fn wrap(&self, key: &[u8]) -> SecureStorageResult<String> {
        let certificate = self.keystore.certificate(self.alias())?.ok_or_else(|| {
            SecureStorageError::KeyMaterialMissing(format!(
                "certificate for {} not found",
                self.config.key_alias
            ))
        })?;
        let public_key = RsaPublicKey::from_public_key_der(&certificate.public_key_der)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("public key: {err}")))?;
        let wrapped = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, key)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("wrap: {err}")))?;
        Ok(STANDARD.encode(wrapped))
    }

    fn unwrap_into(&self, name: &str, out: &mut [u8]) -> SecureStorageResult<()> {
        let encoded = self.store.get(name)?.ok_or_else(|| {
            SecureStorageError::KeyMaterialMissing(format!("wrapped key {name} not found"))
        })?;
        let wrapped = STANDARD
            .decode(encoded)
            .map_err(|err| SecureStorageError::CryptoFailure(format!("{name}: {err}")))?;
        let private_key = self.keystore.private_key(self.alias())?.ok_or_else(|| {
            SecureStorageError::KeyMaterialMissing(format!(
                "private key for {} not found",
                self.config.key_alias
            ))
        })?;
        let key = Zeroizing::new(private_key.decrypt(wrapped)?);
        if key.len() != out.len() {
            return Err(SecureStorageError::CryptoFailure(format!(
                "{name} length mismatch: expected {}, got {}",
                out.len(),
                key.len()
            )));
        }
        out.copy_from_slice(&key);
        Ok(())
    }

    /// Wrapped form of `keys` as `(name, blob)` records.
    fn wrap_keys(
        &self,
        keys: &SecretKeys,
        confidentiality_name: String,
        integrity_name: String,
    ) -> SecureStorageResult<Vec<(String, String)>> {
        Ok(vec![
            (confidentiality_name, self.wrap(keys.confidentiality_key())?),
            (integrity_name, self.wrap(keys.integrity_key())?),
        ])
    }

    fn load_keys(
        &self,
        confidentiality_name: &str,
        integrity_name: &str,
    ) -> SecureStorageResult<SecretKeys> {
        let mut confidentiality = Zeroizing::new([0u8; CONFIDENTIALITY_KEY_SIZE]);
        let mut integrity = Zeroizing::new([0u8; INTEGRITY_KEY_SIZE]);
        self.unwrap_into(confidentiality_name, &mut confidentiality[..])?;
        self.unwrap_into(integrity_name, &mut integrity[..])?;
        Ok(SecretKeys::new(*confidentiality, *integrity))
    }

    /// Keys sealing `entry_key`, plus the wrapped records to store if they are new.
    fn entry_keys(
        &self,
        entry_key: &str,
    ) -> SecureStorageResult<(SecretKeys, Vec<(String, String)>)> {
        let (confidentiality_name, integrity_name) = entry_key_names(entry_key);
        if self.store.contains(&confidentiality_name)? && self.store.contains(&integrity_name)? {
            let keys = self.load_keys(&confidentiality_name, &integrity_name)?;
            return Ok((keys, Vec::new()));
        }
        log::debug!("Generating key pair for entry {entry_key}");
        let keys = SecretKeys::generate();
        let records = self.wrap_keys(&keys, confidentiality_name, integrity_name)?;
        Ok((keys, records))
    }
}

impl KeyBackend for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn key_exists(&self) -> SecureStorageResult<bool> {
        self.keystore.load()?;
        Ok(self.key_pair_exists()?
            && self.store.contains(INSTALLATION_CONFIDENTIALITY_KEY)?
            && self.store.contains(INSTALLATION_INTEGRITY_KEY)?)
    }

    fn generate_key(&self) -> SecureStorageResult<()> {
        self.keystore.load()?;
        if !self.key_pair_exists()? {
            // Blobs wrapped by a previous keypair can never be unwrapped again.
            self.purge_wrapped_keys()?;
            self.generate_key_pair()?;
        }
        let records = self.wrap_keys(
            &SecretKeys::generate(),
            INSTALLATION_CONFIDENTIALITY_KEY.to_string(),
            INSTALLATION_INTEGRITY_KEY.to_string(),
        )?;
        for (name, blob) in &records {
            self.store.put(name, blob)?;
        }
        Ok(())
    }

    fn encrypt(&self, entry_key: &str, plaintext: &str) -> SecureStorageResult<SealedEntry> {
        self.keystore.load()?;
        let (keys, records) = self.entry_keys(entry_key)?;
        Ok(SealedEntry {
            ciphertext: aes_cbc_hmac::encrypt(plaintext.as_bytes(), &keys)?.to_string(),
            records,
        })
    }

    fn decrypt(&self, entry_key: &str, ciphertext: &str) -> SecureStorageResult<String> {
        self.keystore.load()?;
        let (confidentiality_name, integrity_name) = entry_key_names(entry_key);
        let keys = self.load_keys(&confidentiality_name, &integrity_name)?;
        let token: CipherTextIvMac = ciphertext.parse()?;
        Ok(aes_cbc_hmac::decrypt_string(&token, &keys)?)
    }

    fn delete_key(&self) -> SecureStorageResult<()> {
        self.keystore.load()?;
        self.purge_wrapped_keys()?;
        if !self.key_pair_exists()? {
            return Err(SecureStorageError::KeystoreUnavailable(
                "Keypair does not exist".to_string(),
            ));
        }
        self.keystore.delete_entry(self.alias())
    }

    fn forget_entry(&self, entry_key: &str) -> SecureStorageResult<()> {
        let (confidentiality_name, integrity_name) = entry_key_names(entry_key);
        self.store.remove(&confidentiality_name)?;
        self.store.remove(&integrity_name)
    }

    fn is_key_inside_secure_hardware(&self) -> SecureStorageResult<bool> {
        Ok(false)
    }
}
