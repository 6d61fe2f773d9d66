/// Safe truncation helpers for UTF-8 strings.
///
/// Everything that shortens upstream or user text (tool descriptions, log
/// previews, thinking-buffer splits) goes through these so a multi-byte
/// character is never cut in half.

/// Truncate `s` to at most `max_bytes` bytes on a char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    &s[..find_char_boundary(s, max_bytes)]
}

/// Truncate `s` to at most `max_bytes` bytes, appending `...` when shortened.
pub fn truncate_utf8_with_ellipsis(s: &str, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "...";
    if s.len() <= max_bytes {
        return s.to_string();
    }
    if max_bytes <= ELLIPSIS.len() {
        return ELLIPSIS[..max_bytes].to_string();
    }
    let mut out = truncate_utf8(s, max_bytes - ELLIPSIS.len()).to_string();
    out.push_str(ELLIPSIS);
    out
}

/// Largest char boundary in `s` that is `<= pos`.
pub fn find_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut i = pos;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
