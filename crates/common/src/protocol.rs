//! Protocol version utilities.
//!
//! The ledger protocol version gates on-disk format features (meta records,
//! init entries, hot archive buckets). Version checks are written against
//! [`ProtocolVersion`] so the constant being compared is visible at the
//! call site.

/// Protocol version enumeration for type-safe version comparisons.
///
/// The enum uses `#[repr(u32)]` so the discriminant values match the
/// protocol version numbers used on-chain.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
    V6 = 6,
    V7 = 7,
    V8 = 8,
    V9 = 9,
    V10 = 10,
    V11 = 11,
    V12 = 12,
    V13 = 13,
    V14 = 14,
    V15 = 15,
    V16 = 16,
    V17 = 17,
    V18 = 18,
    V19 = 19,
    V20 = 20,
    V21 = 21,
    V22 = 22,
    V23 = 23,
    V24 = 24,
    V25 = 25,
}

impl ProtocolVersion {
    /// Convert to the underlying `u32` value.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Returns `true` if `version` is strictly before the target version.
#[inline]
pub fn protocol_version_is_before(version: u32, before: ProtocolVersion) -> bool {
    version < before.as_u32()
}

/// Returns `true` if `version` is at or after the target version.
///
/// This is the most commonly used version check for feature gating.
#[inline]
pub fn protocol_version_starts_from(version: u32, from: ProtocolVersion) -> bool {
    version >= from.as_u32()
}

/// Returns `true` if `version` equals the target version exactly.
#[inline]
pub fn protocol_version_equals(version: u32, equals: ProtocolVersion) -> bool {
    version == equals.as_u32()
}
