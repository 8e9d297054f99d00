//! Constant-time comparison helpers.

use subtle::ConstantTimeEq;

/// Compare two byte slices without short-circuiting on the first mismatch.
///
/// Slices of different length compare unequal; only the length leaks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// String flavour of [`constant_time_eq`].
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
