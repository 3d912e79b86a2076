//! Shared utility functions for the preview engine.

/// Maximum length of a sanitized project identifier.
pub const MAX_PROJECT_ID_LEN: usize = 64;

/// Reduce a project identifier to `[A-Za-z0-9_-]`, at most `MAX_PROJECT_ID_LEN`
/// characters. Disallowed characters become `-`, runs of `-` collapse, and
/// leading/trailing dashes are dropped. Returns `None` when nothing usable is left.
pub fn sanitize_project_id(input: &str) -> Option<String> {
    let mapped: String = input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let collapsed = mapped
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let truncated = if collapsed.len() > MAX_PROJECT_ID_LEN {
        collapsed[..MAX_PROJECT_ID_LEN].trim_end_matches('-').to_string()
    } else {
        collapsed
    };
    if truncated.is_empty() {
        None
    } else {
        Some(truncated)
    }
}

/// Keep only the last `max_chars` characters of `text`, prefixing `...` when cut.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", tail)
}
