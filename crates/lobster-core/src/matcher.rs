//! Wildcard pattern matching.
//!
//! Patterns are either an exact string or a prefix terminated by `*`.
//! The empty pattern never matches anything.

/// Match `value` against `pattern`.
///
/// ```
/// use lobster_core::wildcard_match;
///
/// assert!(wildcard_match("vms*", "vms/42"));
/// assert!(wildcard_match("plans", "plans"));
/// assert!(!wildcard_match("", "plans"));
/// ```
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    pattern
        .strip_suffix('*')
        .map_or_else(|| pattern == value, |prefix| value.starts_with(prefix))
}
