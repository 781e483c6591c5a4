//! AES-CBC with HMAC-SHA256, encrypt-then-MAC.
//!
//! This is the authenticated encryption used by the legacy backend, where the keystore cannot
//! hold AES keys itself. A message is encrypted under a 128-bit confidentiality key with a random
//! IV, then `HMAC-SHA256(iv || ciphertext)` is computed under a separate 256-bit integrity key.
//!
//! The textual token is `base64(iv):base64(mac):base64(ciphertext)`.

use std::fmt;
use std::str::FromStr;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of the AES confidentiality key in bytes.
pub const CONFIDENTIALITY_KEY_SIZE: usize = 16;
/// Size of the HMAC integrity key in bytes.
pub const INTEGRITY_KEY_SIZE: usize = 32;
/// Size of the CBC initialization vector in bytes.
pub const IV_SIZE: usize = 16;
/// Size of the HMAC-SHA256 tag in bytes.
pub const MAC_SIZE: usize = 32;
/// Size of the salt used for password based key derivation.
pub const SALT_SIZE: usize = 16;
/// PBKDF2 iteration count for password based key derivation.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

const TOKEN_SEPARATOR: char = ':';

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Errors of the cipher adapter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The token or encoded key is not well formed.
    #[error("malformed input: {0}")]
    Malformed(String),
    /// The MAC did not verify; the token was tampered with or the keys are wrong.
    #[error("mac verification failed")]
    MacMismatch,
    /// CBC decryption produced invalid padding.
    #[error("invalid padding")]
    Padding,
    /// The key was rejected by the primitive.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Confidentiality and integrity keys. Wiped on drop.
#[derive(Clone)]
pub struct SecretKeys {
    confidentiality: Zeroizing<[u8; CONFIDENTIALITY_KEY_SIZE]>,
    integrity: Zeroizing<[u8; INTEGRITY_KEY_SIZE]>,
}

impl SecretKeys {
    /// Builds keys from raw bytes.
    #[must_use]
    pub fn new(
        confidentiality: [u8; CONFIDENTIALITY_KEY_SIZE],
        integrity: [u8; INTEGRITY_KEY_SIZE],
    ) -> Self {
        Self {
            confidentiality: Zeroizing::new(confidentiality),
            integrity: Zeroizing::new(integrity),
        }
    }

    /// Generates a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let mut confidentiality = Zeroizing::new([0u8; CONFIDENTIALITY_KEY_SIZE]);
        let mut integrity = Zeroizing::new([0u8; INTEGRITY_KEY_SIZE]);
        OsRng.fill_bytes(&mut confidentiality[..]);
        OsRng.fill_bytes(&mut integrity[..]);
        Self {
            confidentiality,
            integrity,
        }
    }

    /// Derives a key pair from a password and salt with PBKDF2-HMAC-SHA256.
    ///
    /// The same password and salt always yield the same keys.
    #[must_use]
    pub fn derive_from_password(password: &str, salt: &[u8]) -> Self {
        let mut derived = Zeroizing::new([0u8; CONFIDENTIALITY_KEY_SIZE + INTEGRITY_KEY_SIZE]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut derived[..],
        );
        let mut confidentiality = Zeroizing::new([0u8; CONFIDENTIALITY_KEY_SIZE]);
        let mut integrity = Zeroizing::new([0u8; INTEGRITY_KEY_SIZE]);
        confidentiality.copy_from_slice(&derived[..CONFIDENTIALITY_KEY_SIZE]);
        integrity.copy_from_slice(&derived[CONFIDENTIALITY_KEY_SIZE..]);
        Self {
            confidentiality,
            integrity,
        }
    }

    /// Raw confidentiality key. Treat as sensitive.
    #[must_use]
    pub fn confidentiality_key(&self) -> &[u8] {
        &self.confidentiality[..]
    }

    /// Raw integrity key. Treat as sensitive.
    #[must_use]
    pub fn integrity_key(&self) -> &[u8] {
        &self.integrity[..]
    }

    /// Encodes both keys as `base64(confidentiality):base64(integrity)`.
    #[must_use]
    pub fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{}{TOKEN_SEPARATOR}{}",
            STANDARD.encode(&self.confidentiality[..]),
            STANDARD.encode(&self.integrity[..])
        ))
    }

    /// Parses the output of [`SecretKeys::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Malformed`] if the input is not two Base64 keys of the right sizes.
    pub fn decode(encoded: &str) -> Result<Self, CipherError> {
        let (confidentiality, integrity) = encoded
            .split_once(TOKEN_SEPARATOR)
            .ok_or_else(|| CipherError::Malformed("expected two keys".to_string()))?;
        let mut keys = Self::new([0u8; CONFIDENTIALITY_KEY_SIZE], [0u8; INTEGRITY_KEY_SIZE]);
        decode_exact(confidentiality, &mut keys.confidentiality[..], "confidentiality key")?;
        decode_exact(integrity, &mut keys.integrity[..], "integrity key")?;
        Ok(keys)
    }
}

impl fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeys")
            .field("confidentiality", &"[REDACTED]")
            .field("integrity", &"[REDACTED]")
            .finish()
    }
}

/// Generates a random salt for [`SecretKeys::derive_from_password`].
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// An encrypted message: IV, ciphertext and MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherTextIvMac {
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
    mac: [u8; MAC_SIZE],
}

impl CipherTextIvMac {
    /// The CBC initialization vector.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// The CBC ciphertext.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// The HMAC-SHA256 tag over `iv || ciphertext`.
    #[must_use]
    pub const fn mac(&self) -> &[u8; MAC_SIZE] {
        &self.mac
    }
}

impl fmt::Display for CipherTextIvMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{TOKEN_SEPARATOR}{}{TOKEN_SEPARATOR}{}",
            STANDARD.encode(self.iv),
            STANDARD.encode(self.mac),
            STANDARD.encode(&self.ciphertext)
        )
    }
}

impl FromStr for CipherTextIvMac {
    type Err = CipherError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let mut parts = token.split(TOKEN_SEPARATOR);
        let (Some(iv), Some(mac), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CipherError::Malformed(
                "expected iv:mac:ciphertext".to_string(),
            ));
        };

        let mut out = Self {
            iv: [0u8; IV_SIZE],
            ciphertext: STANDARD
                .decode(ciphertext)
                .map_err(|err| CipherError::Malformed(format!("ciphertext: {err}")))?,
            mac: [0u8; MAC_SIZE],
        };
        decode_exact(iv, &mut out.iv, "iv")?;
        decode_exact(mac, &mut out.mac, "mac")?;
        Ok(out)
    }
}

/// Encrypts `plaintext` under `keys` with a fresh random IV.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKey`] if the MAC cannot be keyed.
pub fn encrypt(plaintext: &[u8], keys: &SecretKeys) -> Result<CipherTextIvMac, CipherError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = Aes128CbcEnc::new(
        (&*keys.confidentiality).into(),
        (&iv).into(),
    )
    .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mac = compute_mac(&iv, &ciphertext, keys)?;
    Ok(CipherTextIvMac {
        iv,
        ciphertext,
        mac,
    })
}

/// Verifies the MAC in constant time, then decrypts.
///
/// # Errors
///
/// Returns [`CipherError::MacMismatch`] if authentication fails and [`CipherError::Padding`] if
/// an authentic ciphertext does not unpad (only possible with inconsistent keys).
pub fn decrypt(token: &CipherTextIvMac, keys: &SecretKeys) -> Result<Vec<u8>, CipherError> {
    let expected = compute_mac(&token.iv, &token.ciphertext, keys)?;
    if !bool::from(expected.ct_eq(&token.mac)) {
        return Err(CipherError::MacMismatch);
    }
    Aes128CbcDec::new(
        (&*keys.confidentiality).into(),
        (&token.iv).into(),
    )
    .decrypt_padded_vec_mut::<Pkcs7>(&token.ciphertext)
    .map_err(|_| CipherError::Padding)
}

/// Convenience for text: decrypts and validates UTF-8.
///
/// # Errors
///
/// Same as [`decrypt`], plus [`CipherError::Malformed`] for non UTF-8 plaintext.
pub fn decrypt_string(token: &CipherTextIvMac, keys: &SecretKeys) -> Result<String, CipherError> {
    String::from_utf8(decrypt(token, keys)?)
        .map_err(|err| CipherError::Malformed(format!("plaintext: {err}")))
}

fn compute_mac(
    iv: &[u8],
    ciphertext: &[u8],
    keys: &SecretKeys,
) -> Result<[u8; MAC_SIZE], CipherError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(keys.integrity_key())
        .map_err(|err| CipherError::InvalidKey(err.to_string()))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

fn decode_exact(encoded: &str, out: &mut [u8], label: &str) -> Result<(), CipherError> {
    let decoded = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|err| CipherError::Malformed(format!("{label}: {err}")))?,
    );
    if decoded.len() != out.len() {
        return Err(CipherError::Malformed(format!(
            "{label} length mismatch: expected {}, got {}",
            out.len(),
            decoded.len()
        )));
    }
    out.copy_from_slice(&decoded);
    Ok(())
}
