//! Shared utilities for vmexec.

/// Make an identifier safe to use as a local file name stem.
///
/// Path separators, `..` and other unsafe characters are replaced so that a
/// VM name such as `prod/web 01` cannot escape the output directory.
pub fn sanitize_file_stem(name: &str) -> String {
    if name.is_empty() || name == "." || name == ".." {
        return "unknown".to_string();
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let sanitized = sanitized.replace("..", "_");
    let result = sanitized.trim_start_matches(['.', '-']);
    if result.is_empty() {
        "unknown".to_string()
    } else {
        result.to_string()
    }
}

/// Replace every occurrence of the given secrets with `***` before logging.
///
/// Empty secrets are ignored.
pub fn mask_sensitive(text: &str, secrets: &[&str]) -> String {
    let mut result = text.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        result = result.replace(secret, "***");
    }
    result
}

/// Drop the query string of a URL before logging it.
///
/// Guest transfer URLs carry a signed ticket in the query.
pub fn redact_url_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

/// Format a duration in seconds as a human-readable string.
pub fn humanize_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
