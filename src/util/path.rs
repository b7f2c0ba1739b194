//! Helpers for remote-path strings.
//!
//! Remote paths are absolute, forward-slash separated, and always start
//! with `/`. Folder paths carry a trailing `/` (the root is just `/`),
//! which keeps prefix operations unambiguous: `/doc/` is never a prefix
//! of `/document.txt`.

/// Normalize a raw path: ensure a leading slash and collapse doubled
/// separators. Does not touch the trailing slash.
pub fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    out.push('/');
    let mut prev_slash = true;
    for c in raw.chars() {
        if c == '/' {
            if !prev_slash {
                out.push('/');
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Append the trailing slash that marks a folder path, if missing.
pub fn as_folder_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Last path segment, without any trailing slash. The root yields `""`.
pub fn name_of(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}
