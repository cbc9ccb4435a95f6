//! Filename and album-name normalization.
//!
//! Remote names go through here before they touch the filesystem. The
//! rules: drop characters invalid on common filesystems (`/ \ : * ? " < >
//! |`) and control characters (including NUL), then trim trailing dots and
//! whitespace, which Windows silently strips and would desynchronize the
//! tracker key from the file on disk.

/// Normalize a remote filename.
///
/// Returns `None` when nothing safe is left; the caller skips the photo
/// with a warning.
pub fn normalize_filename(filename: &str) -> Option<String> {
    let cleaned: String = filename
        .chars()
        .filter(|c| {
            !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .collect();
    let trimmed = cleaned.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Sanitize an album name for use as a directory name.
///
/// Invalid characters become underscores; leading/trailing spaces and dots
/// are stripped; an empty result falls back to `"Unknown_Album"`.
pub fn sanitize_album_name(album_name: &str) -> String {
    let replaced: String = album_name
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "Unknown_Album".to_string()
    } else {
        trimmed.to_string()
    }
}
