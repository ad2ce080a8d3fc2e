//! Hostname sanitisation for names clients hand us in option 12.
//!
//! Keep everything up to the first dot or NUL, then require the DNS-label
//! grammar. `localhost` is never acceptable, wherever it came from.

/// Maximum length of a DNS label.
const MAX_LABEL: usize = 63;

/// Sanitize a client-supplied hostname. Returns `None` when nothing usable
/// remains.
pub fn sanitize(raw: &str) -> Option<String> {
    let cut = raw
        .split(['.', '\0'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if cut.is_empty() || cut.len() > MAX_LABEL || cut == "localhost" {
        return None;
    }
    if !is_dns_label(&cut) {
        return None;
    }
    Some(cut)
}

/// `[a-z0-9]([a-z0-9-]*[a-z0-9])?`
pub fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_LABEL {
        return false;
    }
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    inner_ok && bytes[0] != b'-' && bytes[bytes.len() - 1] != b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_at_first_dot_and_nul() {
        assert_eq!(sanitize("printer.lan").as_deref(), Some("printer"));
        assert_eq!(sanitize("printer\0junk").as_deref(), Some("printer"));
        assert_eq!(sanitize("Printer-3").as_deref(), Some("printer-3"));
    }

    #[test]
    fn localhost_is_rejected() {
        assert_eq!(sanitize("localhost"), None);
        assert_eq!(sanitize("LOCALHOST.lan"), None);
    }

    #[test]
    fn grammar_violations_are_rejected()  {
        assert_eq!(sanitize(""), None);
        assert_eq!(sanitize("-leading"), None);
        assert_eq!(sanitize("trailing-"), None);
        assert_eq!(sanitize("has space"), None);
        assert_eq!(sanitize("über"), None);
        assert_eq!(sanitize(&"x".repeat(64)), None);
        assert_eq!(sanitize(&"x".repeat(63)).as_deref(), Some("x".repeat(63).as_str()));
    }
}
