//! Anti-phishing blocklist: hostnames that get rewritten to the ring router
//! for enforcement-enabled rings. The list lives in a flat file named by
//! `@/updates/dns_blocklist` and is reloaded on `net.update` events.
use std::{collections::HashSet, path::Path, sync::RwLock};

use tracing::{info, warn};

/// Lowercased hostnames to block.
#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: RwLock<HashSet<String>>,
}

impl Blocklist {
    /// empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list from a file: one hostname per line, `#` comments.
    pub fn load_file(&self, path: &Path) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), ?err, "could not read blocklist");
                return;
            }
        };
        let hosts: HashSet<String> = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.trim_end_matches('.').to_lowercase())
            .collect();
        info!(path = %path.display(), count = hosts.len(), "blocklist loaded");
        *self.hosts.write().expect("blocklist lock poisoned") = hosts;
    }

    /// Is the hostname (any case, trailing dot or not) blocked?
    pub fn contains(&self, host: &str) -> bool {
        let key = host.trim_end_matches('.').to_lowercase();
        self.hosts
            .read()
            .expect("blocklist lock poisoned")
            .contains(&key)
    }

    /// entries currently loaded
    pub fn len(&self) -> usize {
        self.hosts.read().expect("blocklist lock poisoned").len()
    }

    /// is the list empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_and_match_normalized() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# bad actors").unwrap();
        writeln!(file, "badsite.example").unwrap();
        writeln!(file, "PHISH.example.").unwrap();
        writeln!(file).unwrap();
        let list = Blocklist::new();
        list.load_file(file.path());

        assert_eq!(list.len(), 2);
        assert!(list.contains("badsite.example."));
        assert!(list.contains("phish.EXAMPLE"));
        assert!(!list.contains("goodsite.example"));
    }

    #[test]
    fn missing_file_keeps_previous_list() {
        let list = Blocklist::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "badsite.example").unwrap();
        list.load_file(file.path());
        assert_eq!(list.len(), 1);

        list.load_file(Path::new("/nonexistent/blocklist"));
        assert_eq!(list.len(), 1, "failed reload must not clear the list");
    }
}
