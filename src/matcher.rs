//! Minimal glob matcher for rule path patterns.
//!
//! Supported pattern forms:
//!
//! - `*` or `**` matches any path
//! - a pattern ending in `/*` or `/**` matches any path that begins with the
//!   pattern's prefix (the two suffixes are equivalent)
//! - anything else is a case-insensitive exact match
//!
//! Query strings are stripped from the path before matching. Empty patterns
//! never match.

/// Check whether `path` matches `pattern`.
///
/// Matching is ASCII case-insensitive and ignores any `?query=...` suffix on
/// the path.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let path = path.split('?').next().unwrap_or(path);

    if pattern == "*" || pattern == "**" {
        return true;
    }

    if let Some(prefix) = pattern
        .strip_suffix("/**")
        .or_else(|| pattern.strip_suffix("/*"))
    {
        return path
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase());
    }

    path.eq_ignore_ascii_case(pattern)
}
