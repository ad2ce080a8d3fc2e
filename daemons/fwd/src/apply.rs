//! Atomic apply: write the compiled document, load it with one
//! `iptables-restore` invocation. The restore command parses the whole file
//! before touching any table, so a failure leaves the previous ruleset
//! loaded.
use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::FwError;

/// where the compiled ruleset lands
pub const RULES_PATH: &str = "/tmp/iptables.rules";

/// Write the document to `path` via a temp file and rename.
pub fn write_rules(path: &Path, document: &str) -> Result<(), FwError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, document)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), bytes = document.len(), "ruleset written");
    Ok(())
}

/// Load the ruleset file with `iptables-restore`.
pub async fn load_rules(path: &Path) -> Result<(), FwError> {
    let output = Command::new("iptables-restore")
        .arg(path)
        .output()
        .await?;
    if !output.status.success() {
        return Err(FwError::Apply(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    info!(path = %path.display(), "ruleset applied");
    Ok(())
}

/// Write then load.
pub async fn apply(path: &Path, document: &str) -> Result<(), FwError> {
    write_rules(path, document)?;
    load_rules(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iptables.rules");
        write_rules(&path, "first\n").unwrap();
        write_rules(&path, "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        // no temp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn failed_load_reports_apply_error() {
        // a file that is definitely not a ruleset; iptables-restore is absent
        // or unprivileged in test environments, either way the load must fail
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.rules");
        write_rules(&path, "not a ruleset\n").unwrap();
        assert!(load_rules(&path).await.is_err());
    }
}
