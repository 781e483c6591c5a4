//! Cryptographic building blocks used by the key backends.
//!
//! [`aes_cbc_hmac`] is the authenticated cipher of the legacy backend. [`validity`] computes the
//! validity window of generated keys.

pub mod aes_cbc_hmac;
mod validity;

pub use aes_cbc_hmac::{
    generate_salt, CipherError, CipherTextIvMac, SecretKeys, CONFIDENTIALITY_KEY_SIZE,
    INTEGRITY_KEY_SIZE,
};
pub use validity::{ValidityWindow, KEY_VALIDITY_YEARS};

use crate::error::SecureStorageError;

impl From<CipherError> for SecureStorageError {
    fn from(err: CipherError) -> Self {
        Self::CryptoFailure(err.to_string())
    }
}
