//! Per-aggregate versions and the projection version guard.

use serde::{Deserialize, Serialize};

/// Monotonic per-aggregate version counter.
///
/// Stored as a signed 64-bit integer in read stores that lack unsigned types;
/// see [`Version::as_i64`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Storage representation. Saturates at `i64::MAX`.
    pub fn as_i64(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Inverse of [`Version::as_i64`]; negative values clamp to zero.
    pub fn from_i64(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }

    /// Decide what a version-guarded upsert must do.
    ///
    /// - no stored document: insert
    /// - stored version strictly older: replace wholesale
    /// - stored version equal or newer: discard (duplicate or out-of-order delivery)
    pub fn guard(stored: Option<Version>, incoming: Version) -> VersionDecision {
        match stored {
            None => VersionDecision::Insert,
            Some(current) if current < incoming => VersionDecision::Replace,
            Some(_) => VersionDecision::Discard,
        }
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Result of [`Version::guard`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VersionDecision {
    Insert,
    Replace,
    Discard,
}

impl VersionDecision {
    pub fn writes(self) -> bool {
        !matches!(self, VersionDecision::Discard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absent_document_is_inserted() {
        assert_eq!(Version::guard(None, Version::new(1)), VersionDecision::Insert);
    }

    #[test]
    fn equal_version_is_discarded() {
        assert_eq!(
            Version::guard(Some(Version::new(3)), Version::new(3)),
            VersionDecision::Discard
        );
    }

    #[test]
    fn storage_representation_saturates() {
        assert_eq!(Version::new(u64::MAX).as_i64(), i64::MAX);
        assert_eq!(Version::from_i64(-4), Version::new(0));
    }

    proptest! {
        /// Property: a write happens exactly when the incoming version is newer.
        #[test]
        fn guard_writes_only_newer_versions(stored in 0u64..10_000, incoming in 0u64..10_000) {
            let decision = Version::guard(Some(Version::new(stored)), Version::new(incoming));
            prop_assert_eq!(decision.writes(), incoming > stored);
        }
    }
}
