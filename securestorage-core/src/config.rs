//! Configuration of a secure storage instance.

use serde::{Deserialize, Serialize};

use crate::error::{SecureStorageError, SecureStorageResult};
use crate::persistence::PersistenceMode;

/// Default namespace of the backing store.
pub const DEFAULT_NAMESPACE: &str = "SecureStorage2";
/// Default keystore alias of the installation key.
pub const DEFAULT_KEY_ALIAS: &str = "SecureStorage2Key";
/// Default subject of the legacy keypair certificate.
pub const DEFAULT_SUBJECT_DN: &str = "CN=SecureStorage2, O=Adorsys GmbH & Co. KG., C=Germany";

/// Configuration for [`crate::SecureStorage`].
///
/// Hosts may build it directly or ship it as JSON; missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
#[serde(default)]
pub struct SecureStorageConfig {
    /// Name the host opens the backing key-value store under, e.g. the `SharedPreferences`
    /// file.
    ///
    /// Secure storage never opens stores itself; the host passes the opened store to
    /// [`crate::SecureStorage::new`]. Inside the library the namespace only labels log records
    /// and the `Debug` output of the instance.
    pub namespace: String,
    /// Keystore alias of the installation key (RSA keypair or AES key).
    pub key_alias: String,
    /// Subject distinguished name of the legacy keypair certificate.
    pub subject_dn: String,
    /// Refuse to operate unless the device has secure hardware.
    pub require_hardware_only: bool,
    /// Let writes return before the backing store has persisted them.
    pub async_persistence: bool,
}

impl Default for SecureStorageConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            subject_dn: DEFAULT_SUBJECT_DN.to_string(),
            require_hardware_only: false,
            async_persistence: false,
        }
    }
}

impl SecureStorageConfig {
    /// Default configuration in the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON configuration and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::InvalidConfig`] for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> SecureStorageResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| SecureStorageError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values secure storage cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> SecureStorageResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(SecureStorageError::InvalidConfig(
                "namespace must not be empty".to_string(),
            ));
        }
        if self.key_alias.trim().is_empty() {
            return Err(SecureStorageError::InvalidConfig(
                "key alias must not be empty".to_string(),
            ));
        }
        let has_common_name = self
            .subject_dn
            .split(',')
            .any(|part| part.trim_start().starts_with("CN=") && part.trim().len() > 3);
        if !has_common_name {
            return Err(SecureStorageError::InvalidConfig(format!(
                "subject must contain a CN component: {}",
                self.subject_dn
            )));
        }
        Ok(())
    }

    /// Persistence mode selected by `async_persistence`.
    #[must_use]
    pub const fn persistence_mode(&self) -> PersistenceMode {
        if self.async_persistence {
            PersistenceMode::Deferred
        } else {
            PersistenceMode::Synchronous
        }
    }
}
