//! Shared utilities for the e2e harness.

const RANDOM_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric string, safe for Kubernetes object names.
pub fn random_string(len: usize) -> String {
    (0..len)
        .map(|_| RANDOM_CHARSET[fastrand::usize(..RANDOM_CHARSET.len())] as char)
        .collect()
}

/// `<prefix>-<6 random chars>`, the naming scheme used for per-run namespaces
/// and clusters so parallel runs never collide.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, random_string(6))
}

/// Replace anything that is not safe in a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        sanitized
    }
}
