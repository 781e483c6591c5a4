//! Device capability probe.

/// First platform API level whose keystore can generate AES keys in hardware (Android 6.0).
pub const HARDWARE_SYMMETRIC_MIN_API_LEVEL: u32 = 23;

/// Side-effect free queries about the device secure storage runs on.
#[uniffi::export(with_foreign)]
pub trait DeviceCapabilities: Send + Sync {
    /// Returns `true` if the device exposes secure hardware (TEE or SE) for key storage.
    ///
    /// Absence of secure hardware is a normal `false`, never an error. On Android this is
    /// typically answered through the fingerprint HAL, which vendors must back with a TEE.
    fn has_secure_hardware_support(&self) -> bool;

    /// Returns the running platform API level (`Build.VERSION.SDK_INT` on Android).
    ///
    /// Only consulted the first time an installation is provisioned.
    fn platform_api_level(&self) -> u32;
}
