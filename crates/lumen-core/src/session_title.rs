use lumen_types::DEFAULT_SESSION_TITLE;

pub const SESSION_TITLE_MAX_CHARS: usize = 50;

/// Builds a session title from the first user message. Line breaks collapse to
/// spaces; text longer than `max_chars` is cut and suffixed with `...`.
pub fn derive_session_title_from_prompt(source: &str, max_chars: usize) -> Option<String> {
    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= max_chars {
        return Some(collapsed);
    }
    let mut title = collapsed.chars().take(max_chars).collect::<String>();
    title.push_str("...");
    Some(title)
}

/// True while a session still carries its placeholder title.
pub fn title_needs_derivation(title: &str) -> bool {
    let trimmed = title.trim();
    trimmed.is_empty() || trimmed == DEFAULT_SESSION_TITLE
}
