//! Error types for secure storage.

use thiserror::Error;

/// Result type for secure storage operations.
pub type SecureStorageResult<T> = Result<T, SecureStorageError>;

/// Errors raised by secure storage and by the platform components it drives.
#[derive(Debug, Error, uniffi::Error)]
pub enum SecureStorageError {
    /// The native keystore cannot be opened, or refused a key operation.
    ///
    /// This is fatal for the current process; retrying will not help.
    #[error("keystore unavailable: {0}")]
    KeystoreUnavailable(String),

    /// Hardware-only operation was requested but the device has no secure hardware.
    ///
    /// The library is inert for the rest of the process.
    #[error("secure hardware is required but not supported on this device")]
    HardwareUnsupported,

    /// Key generation, MAC verification or cipher failures.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Key material passed the existence check but could not be retrieved.
    #[error("key material missing: {0}")]
    KeyMaterialMissing(String),

    /// Errors coming from the backing key-value store.
    #[error("store error: {0}")]
    Store(String),

    /// The entry name belongs to a record secure storage keeps for itself.
    #[error("reserved entry name: {0}")]
    ReservedName(String),

    /// The configuration is not usable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Unexpected `UniFFI` callback error.
    #[error("unexpected uniffi callback error: {0}")]
    UnexpectedUniFFICallbackError(String),
}

impl SecureStorageError {
    /// Returns `true` for errors that mean the keystore itself cannot be relied on.
    ///
    /// [`SecureStorageError::KeyMaterialMissing`] counts as a keystore failure: the
    /// existence check said the key was there, so the keystore lost it.
    #[must_use]
    pub const fn is_keystore_failure(&self) -> bool {
        matches!(
            self,
            Self::KeystoreUnavailable(_) | Self::KeyMaterialMissing(_)
        )
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for SecureStorageError {
    fn from(error: uniffi::UnexpectedUniFFICallbackError) -> Self {
        Self::UnexpectedUniFFICallbackError(error.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_material_missing_is_keystore_failure() {
        assert!(SecureStorageError::KeyMaterialMissing("alias".to_string())
            .is_keystore_failure());
        assert!(SecureStorageError::KeystoreUnavailable("down".to_string())
            .is_keystore_failure());
        assert!(!SecureStorageError::CryptoFailure("mac".to_string()).is_keystore_failure());
        assert!(!SecureStorageError::HardwareUnsupported.is_keystore_failure());
    }
}
