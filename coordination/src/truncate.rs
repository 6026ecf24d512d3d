//! Character-budget truncation for agent output.
//!
//! Agents print their machine-parsable conclusions (verdict markers, PR urls)
//! last, so callers usually keep the tail.

/// Trim `text` and cut it to at most `max_chars` characters.
///
/// Returns the excerpt and whether anything was dropped. A budget of zero
/// disables truncation.
pub fn truncate_text(text: &str, max_chars: usize, tail: bool) -> (String, bool) {
    let text = text.trim();
    if max_chars == 0 {
        return (text.to_string(), false);
    }
    let total = text.chars().count();
    if total <= max_chars {
        return (text.to_string(), false);
    }

    let excerpt = if tail {
        let skip = total - max_chars;
        match text.char_indices().nth(skip) {
            Some((offset, _)) => &text[offset..],
            None => "",
        }
    } else {
        match text.char_indices().nth(max_chars) {
            Some((offset, _)) => &text[..offset],
            None => text,
        }
    };
    (excerpt.to_string(), true)
}

/// Collapse whitespace runs and clip to `limit` characters, for log lines and
/// event previews.
pub fn preview(text: &str, limit: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= limit {
        return normalized;
    }
    let mut clipped: String = normalized.chars().take(limit).collect();
    clipped.push_str("...");
    clipped
}
