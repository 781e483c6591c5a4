//! Hardware keystore interface and opaque key handles.
//!
//! The keystore generates and keeps keys; secure storage only ever holds handles. Private and
//! secret keys stay inside the secure boundary, and all operations on them run through
//! [`PrivateKeyHandle`] and [`SecretKeyHandle`]. Public keys are not secret and are exposed as
//! DER inside a [`Certificate`].

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::SecureStorageResult;

/// Native keystore (Android Keystore, Keychain, ...).
///
/// Every method may fail with [`crate::SecureStorageError::KeystoreUnavailable`] when the
/// keystore cannot be loaded.
#[uniffi::export(with_foreign)]
pub trait HardwareKeystore: Send + Sync {
    /// Loads (opens) the keystore. Must be cheap to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be opened.
    fn load(&self) -> SecureStorageResult<()>;

    /// Returns the private key of the keypair stored under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    fn private_key(&self, alias: String) -> SecureStorageResult<Option<Arc<dyn PrivateKeyHandle>>>;

    /// Returns the certificate (and with it the public key) of the keypair under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    fn certificate(&self, alias: String) -> SecureStorageResult<Option<Certificate>>;

    /// Returns the secret key entry stored under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    fn secret_key(&self, alias: String) -> SecureStorageResult<Option<Arc<dyn SecretKeyHandle>>>;

    /// Returns `true` if any entry exists under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be queried.
    fn contains_alias(&self, alias: String) -> SecureStorageResult<bool>;

    /// Deletes the entry under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be deleted.
    fn delete_entry(&self, alias: String) -> SecureStorageResult<()>;

    /// Generates an RSA keypair inside the keystore.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails.
    fn generate_key_pair(&self, spec: KeyPairSpec) -> SecureStorageResult<()>;

    /// Generates a symmetric key inside the keystore and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails, including when `spec` demands secure hardware the
    /// device does not have.
    fn generate_secret_key(&self, spec: SecretKeySpec)
        -> SecureStorageResult<Arc<dyn SecretKeyHandle>>;
}

/// Handle to an RSA private key held by the keystore.
#[uniffi::export(with_foreign)]
pub trait PrivateKeyHandle: Send + Sync {
    /// Decrypts an RSA PKCS#1 v1.5 ciphertext.
    ///
    /// # Errors
    ///
    /// Returns an error if the ciphertext does not decrypt under this key.
    fn decrypt(&self, ciphertext: Vec<u8>) -> SecureStorageResult<Vec<u8>>;
}

/// Handle to an AES key held by the keystore.
#[uniffi::export(with_foreign)]
pub trait SecretKeyHandle: Send + Sync {
    /// Encrypts `plaintext` with a fresh IV chosen by the keystore.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore refuses the operation.
    fn encrypt(&self, plaintext: Vec<u8>) -> SecureStorageResult<SealedData>;

    /// Decrypts `ciphertext` using the explicit `iv` it was produced with.
    ///
    /// # Errors
    ///
    /// Returns an error on a wrong IV length, bad padding or a refused operation.
    fn decrypt(&self, iv: Vec<u8>, ciphertext: Vec<u8>) -> SecureStorageResult<Vec<u8>>;

    /// Returns `true` if the key material lives in a TEE or secure element.
    fn is_inside_secure_hardware(&self) -> bool;
}

/// Output of [`SecretKeyHandle::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SealedData {
    /// IV generated by the cipher.
    pub iv: Vec<u8>,
    /// Ciphertext, including padding.
    pub ciphertext: Vec<u8>,
}

/// Self-signed certificate of a keystore keypair.
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct Certificate {
    /// Distinguished name of the subject, e.g. `CN=App, O=Company, C=Country`.
    pub subject: String,
    /// Certificate serial number.
    pub serial_number: u64,
    /// Start of the validity window.
    pub not_before: SystemTime,
    /// End of the validity window.
    pub not_after: SystemTime,
    /// `SubjectPublicKeyInfo` of the RSA public key, DER encoded.
    pub public_key_der: Vec<u8>,
}

/// Parameters for [`HardwareKeystore::generate_key_pair`].
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct KeyPairSpec {
    /// Alias the keypair is stored under.
    pub alias: String,
    /// Subject distinguished name of the self-signed certificate.
    pub subject: String,
    /// Certificate serial number.
    pub serial_number: u64,
    /// RSA modulus size in bits.
    pub key_size: u32,
    /// Start of the validity window.
    pub not_before: SystemTime,
    /// End of the validity window.
    pub not_after: SystemTime,
}

/// Parameters for [`HardwareKeystore::generate_secret_key`].
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SecretKeySpec {
    /// Alias the key is stored under.
    pub alias: String,
    /// AES key size in bits.
    pub key_size: u32,
    /// Operations the key may be used for.
    pub purposes: Vec<KeyPurpose>,
    /// Block mode the key is restricted to.
    pub block_mode: BlockMode,
    /// Padding the key is restricted to.
    pub padding: EncryptionPadding,
    /// Start of the validity window.
    pub not_before: SystemTime,
    /// Require a dedicated secure element (`StrongBox`).
    pub strongbox_backed: bool,
    /// Require explicit user confirmation for key use.
    pub user_confirmation_required: bool,
}

/// Operation a key is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum KeyPurpose {
    /// Encryption.
    Encrypt,
    /// Decryption.
    Decrypt,
}

/// Block cipher mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum BlockMode {
    /// Cipher block chaining.
    Cbc,
}

/// Block cipher padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum EncryptionPadding {
    /// PKCS#7 padding.
    Pkcs7,
}
