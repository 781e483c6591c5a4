use std::time::SystemTime;

use chrono::{DateTime, Days, Months, SecondsFormat, Utc};

/// Lifetime of generated keys and certificates, in years.
pub const KEY_VALIDITY_YEARS: u32 = 99;

/// Validity window of a generated key: from one day in the past to 99 years ahead.
///
/// Starting a day early tolerates clock skew between key generation and first use. The window is
/// computed with calendar arithmetic in UTC, so the device locale never influences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// Builds the window for a key generated at `now`.
    #[must_use]
    pub fn starting_yesterday(now: DateTime<Utc>) -> Self {
        let not_before = now.checked_sub_days(Days::new(1)).unwrap_or(now);
        let not_after = not_before
            .checked_add_months(Months::new(KEY_VALIDITY_YEARS * 12))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            not_before,
            not_after,
        }
    }

    /// Builds the window for a key generated right now.
    #[must_use]
    pub fn now() -> Self {
        Self::starting_yesterday(Utc::now())
    }

    /// Start of the window.
    #[must_use]
    pub const fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the window.
    #[must_use]
    pub const fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Start of the window as a [`SystemTime`], for the keystore interface.
    #[must_use]
    pub fn not_before_system_time(&self) -> SystemTime {
        self.not_before.into()
    }

    /// End of the window as a [`SystemTime`], for the keystore interface.
    #[must_use]
    pub fn not_after_system_time(&self) -> SystemTime {
        self.not_after.into()
    }

    /// Human readable form for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} .. {}",
            self.not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.not_after.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
