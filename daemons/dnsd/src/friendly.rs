//! Friendly-DNS derivation: turn a human display name into a unique,
//! DNS-legal label of at most 16 characters.
use std::collections::HashSet;

/// hard cap on a derived label
pub const MAX_FRIENDLY: usize = 16;

/// Derive the base label: lowercase, space/underscore to hyphen, collapse
/// hyphen runs, drop leading hyphens, strip anything outside `[a-z0-9-]`,
/// truncate to 16. Returns `None` when nothing usable remains or the result
/// would be `localhost`.
pub fn derive(friendly_name: &str) -> Option<String> {
    let mut out = String::new();
    for ch in friendly_name.chars() {
        let mapped = match ch {
            ' ' | '_' => Some('-'),
            c if c.is_ascii_uppercase() => Some(c.to_ascii_lowercase()),
            c if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' => Some(c),
            _ => None,
        };
        let Some(c) = mapped else { continue };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            // no leading hyphens, no runs
            continue;
        }
        out.push(c);
        if out.len() == MAX_FRIENDLY {
            break;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() || out == "localhost" {
        return None;
    }
    Some(out)
}

/// Derive a label that does not collide with `taken`, suffixing `-1`, `-2`,
/// ... while keeping the 16-character cap.
pub fn derive_unique(friendly_name: &str, taken: &HashSet<String>) -> Option<String> {
    let base = derive(friendly_name)?;
    if !taken.contains(&base) {
        return Some(base);
    }
    for n in 1u32.. {
        let suffix = format!("-{n}");
        let keep = MAX_FRIENDLY.saturating_sub(suffix.len());
        let mut candidate = base.chars().take(keep).collect::<String>();
        while candidate.ends_with('-') {
            candidate.pop();
        }
        candidate.push_str(&suffix);
        if !taken.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_rules() {
        assert_eq!(derive("Front Desk Printer").as_deref(), Some("front-desk-print"));
        assert_eq!(derive("under_score").as_deref(), Some("under-score"));
        assert_eq!(derive("--lead--ing").as_deref(), Some("lead-ing"));
        assert_eq!(derive("emoji 🎉 box").as_deref(), Some("emoji-box"));
        assert_eq!(derive("ALLCAPS").as_deref(), Some("allcaps"));
    }

    #[test]
    fn degenerate_names_yield_nothing() {
        // 200 spaces collapse to the empty string
        assert_eq!(derive(&" ".repeat(200)), None);
        assert_eq!(derive("___"), None);
        assert_eq!(derive("🎉🎉"), None);
        assert_eq!(derive("localhost"), None);
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        let mut taken = HashSet::new();
        taken.insert("printer".to_owned());
        assert_eq!(
            derive_unique("Printer", &taken).as_deref(),
            Some("printer-1")
        );
        taken.insert("printer-1".to_owned());
        assert_eq!(
            derive_unique("Printer", &taken).as_deref(),
            Some("printer-2")
        );
    }

    #[test]
    fn suffixed_labels_respect_the_cap() {
        let mut taken = HashSet::new();
        let base = derive("a very long device name").unwrap();
        assert!(base.len() <= MAX_FRIENDLY);
        taken.insert(base.clone());
        let next = derive_unique("a very long device name", &taken).unwrap();
        assert!(next.len() <= MAX_FRIENDLY, "{next}");
        assert!(next.ends_with("-1"));
    }
}
