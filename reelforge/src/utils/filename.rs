//! Filename sanitizing for names built from provider-supplied values.

/// Characters rejected by at least one of Windows, Linux or macOS.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make `input` safe to use as a single path component.
///
/// Path separators and control characters become `_` (runs collapse to
/// one), leading and trailing dots and spaces are trimmed, and reserved
/// device names get a `_` prefix. Empty results become `"unnamed"`.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;
    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    let stem = upper.split('.').next().unwrap_or_default();
    if WINDOWS_RESERVED_NAMES.contains(&stem) {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}
