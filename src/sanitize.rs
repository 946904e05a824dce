#![forbid(unsafe_code)]

//! Turns arbitrary remote titles into safe, length-bounded path segments.

/// Characters that never survive into a filename.
const RESERVED: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|', '#'];

/// Longest trailing segment after the final `.` still treated as an
/// extension when truncating.
const MAX_EXTENSION_LEN: usize = 10;

pub const DEFAULT_MAX_FILENAME_LEN: usize = 200;

const PLACEHOLDER: &str = "untitled";

/// Strips reserved characters, trims surrounding whitespace and dots, and
/// bounds the result to `max_length` while keeping a plausible extension
/// attached. Empty results become `"untitled"`.
pub fn sanitize_filename(name: &str, max_length: usize) -> String {
    let stripped: String = name.chars().filter(|c| !RESERVED.contains(c)).collect();
    let mut sanitized = stripped
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();

    if sanitized.chars().count() > max_length {
        sanitized = truncate_keeping_extension(&sanitized, max_length);
    }

    if sanitized.is_empty() {
        sanitized = PLACEHOLDER.to_string();
    }

    sanitized
}

fn truncate_keeping_extension(value: &str, max_length: usize) -> String {
    if let Some((base, ext)) = value.rsplit_once('.')
        && !ext.is_empty()
        && ext.chars().count() <= MAX_EXTENSION_LEN
    {
        let ext_len = ext.chars().count() + 1;
        if max_length > ext_len {
            let kept: String = base.chars().take(max_length - ext_len).collect();
            return format!("{kept}.{ext}");
        }
        return base.chars().take(max_length).collect();
    }
    value.chars().take(max_length).collect()
}

/// Lowercases and sanitizes a username so it can name a scope directory.
/// Display casing is the caller's concern; on disk everything is lowercase.
/// A name with no usable characters is rejected rather than mapped onto the
/// shared placeholder.
pub fn normalize_username(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let cleaned: String = lowered.chars().filter(|c| !RESERVED.contains(c)).collect();
    let cleaned = cleaned.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if cleaned.is_empty() {
        return None;
    }
    Some(sanitize_filename(cleaned, DEFAULT_MAX_FILENAME_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_reserved_characters() {
        assert_eq!(
            sanitize_filename("file/with/slashes.txt", 200),
            "filewithslashes.txt"
        );
        assert_eq!(sanitize_filename("a\\b*c?d:e\"f<g>h|i#j", 200), "abcdefghij");
    }

    #[test]
    fn trims_whitespace_and_dots() {
        assert_eq!(sanitize_filename("  .title. ", 200), "title");
    }

    #[test]
    fn hard_truncates_without_extension() {
        let long = "a".repeat(300);
        let result = sanitize_filename(&long, 200);
        assert_eq!(result.len(), 200);
    }

    #[test]
    fn truncation_preserves_short_extension() {
        let long = format!("{}.mp4", "a".repeat(300));
        let result = sanitize_filename(&long, 200);
        assert!(result.ends_with(".mp4"));
        assert!(result.len() <= 200);
    }

    #[test]
    fn long_trailing_segment_is_not_an_extension() {
        let long = format!("{}.{}", "a".repeat(300), "b".repeat(20));
        let result = sanitize_filename(&long, 200);
        assert_eq!(result.len(), 200);
        assert!(!result.ends_with(&"b".repeat(20)));
    }

    #[test]
    fn empty_input_becomes_placeholder() {
        assert_eq!(sanitize_filename("", 200), "untitled");
        assert_eq!(sanitize_filename("...", 200), "untitled");
        assert_eq!(sanitize_filename("###", 200), "untitled");
    }

    #[test]
    fn output_never_contains_reserved_characters() {
        let nasty = r#"a\b/c*d?e:f"g<h>i|j#k.mp3"#;
        let result = sanitize_filename(nasty, 200);
        for c in RESERVED {
            assert!(!result.contains(*c), "found {c:?} in {result:?}");
        }
    }

    #[test]
    fn normalize_username_lowercases() {
        assert_eq!(normalize_username("  Alice "), Some("alice".to_string()));
        assert_eq!(normalize_username("Bob/Smith"), Some("bobsmith".to_string()));
        assert_eq!(normalize_username("   "), None);
        assert_eq!(normalize_username("###"), None);
    }
}
