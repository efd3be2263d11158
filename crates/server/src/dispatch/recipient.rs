const USER_SUFFIX: &str = "@s.whatsapp.net";

/// Turn a user-entered phone number into a network address.
///
/// Spaces, `+`, `-` and parentheses are dropped. Input that already carries
/// a domain (`...@s.whatsapp.net`, `...@g.us`) passes through unchanged.
/// Returns `None` for anything that is not a plain number.
pub fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        return Some(trimmed.to_string());
    }

    let digits: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '+' | '-' | '(' | ')'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}{}", digits, USER_SUFFIX))
}
