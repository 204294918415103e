/// Longest filename, in bytes, that [`sanitize_filename`] produces.
pub const MAX_FILENAME_BYTES: usize = 200;

/// Extensions longer than this are not preserved when truncating.
const MAX_EXTENSION_BYTES: usize = 16;

/// Name used when nothing usable is left of the client's filename.
const FALLBACK_NAME: &str = "upload";

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turns an untrusted client filename into a single safe path component.
///
/// - Path separators, `< > : " | ? *` and control characters become `_`
/// - Leading and trailing dots and spaces are trimmed
/// - An empty result (including `.` and `..`) becomes `upload`
/// - Names over [`MAX_FILENAME_BYTES`] are truncated on a char boundary,
///   keeping a short extension
/// - Windows device names (`CON`, `nul.txt`, ...) get a `_` prefix, checked
///   after truncation since cutting a long name can leave one behind
///
/// Sanitizing an already sanitized name returns it unchanged.
pub fn sanitize_filename(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if is_forbidden(c) { '_' } else { c })
        .collect();

    let trimmed = replaced.trim_matches(['.', ' ']);
    let name = if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        truncate(trimmed.to_string())
    };

    if is_reserved(&name) {
        truncate(format!("_{name}"))
    } else {
        name
    }
}

fn is_forbidden(c: char) -> bool {
    matches!(c, '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*') || c.is_control()
}

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

fn truncate(name: String) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name;
    }

    let ext = match name.rfind('.') {
        Some(pos) if pos > 0 && name.len() - pos <= MAX_EXTENSION_BYTES => &name[pos..],
        _ => "",
    };
    let stem = &name[..name.len() - ext.len()];
    let stem = floor_char_boundary(stem, MAX_FILENAME_BYTES - ext.len());
    let stem = stem.trim_end_matches(['.', ' ']);

    format!("{stem}{ext}")
}

fn floor_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
