//! Hardware GUID derivation.
//!
//! Identity GUIDs are version-5 UUIDs computed from a fixed namespace over
//! the UTF-16LE encoding of the source string, so the same instance string
//! maps to the same GUID on every platform and every run.

use uuid::Uuid;

/// Namespace under which all hardware identity GUIDs are derived.
const HARDWARE_NAMESPACE: Uuid = Uuid::from_u128(0x70ffd812_4c7f_4c7d_0000_0000_0000_0000);

/// Hash an arbitrary instance string into a canonical GUID string.
pub fn from_string(value: &str) -> String {
    let mut bytes = Vec::with_capacity(value.len() * 2);
    for unit in value.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    Uuid::new_v5(&HARDWARE_NAMESPACE, &bytes).to_string()
}

/// Whether a string is already a canonical hyphenated GUID.
pub fn is_guid(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}
