//! Persistence: the tree is exported as a JSON document keyed by its root
//! hash. On load the hash is recomputed and compared; a mismatch fails the
//! load rather than serving corrupt state. Expiry survives restarts because
//! deadlines are stored as absolute instants.
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{node::Node, TreeError};

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    hash: String,
    tree: Node,
}

/// Export the tree to `path`. The write goes through a temp file and rename
/// so a crash mid-write leaves the previous document intact.
pub fn save(path: &Path, root: &Node) -> Result<(), TreeError> {
    let doc = Document {
        hash: root.subtree_hash(),
        tree: root.clone(),
    };
    let serialized = serde_json::to_vec_pretty(&doc)?;
    let tmp = path.with_extension("tmp");
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), hash = %doc.hash, "tree persisted");
    Ok(())
}

/// Load a previously exported tree, verifying the embedded hash.
pub fn load(path: &Path) -> Result<Node, TreeError> {
    let raw = std::fs::read(path)?;
    let doc: Document = serde_json::from_slice(&raw)?;
    let computed = doc.tree.subtree_hash();
    if computed != doc.hash {
        return Err(TreeError::StoreHashMismatch {
            stored: doc.hash,
            computed,
        });
    }
    info!(path = %path.display(), hash = %doc.hash, nodes = doc.tree.len(), "tree restored");
    Ok(doc.tree)
}

/// Load if the document exists, else start empty.
pub fn load_or_default(path: &Path) -> Result<Node, TreeError> {
    if path.exists() {
        load(path)
    } else {
        info!(path = %path.display(), "no persisted tree, starting empty");
        Ok(Node::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PropPath;
    use chrono::{Duration, Utc};

    #[test]
    fn save_load_round_trip_preserves_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");

        let mut root = Node::default();
        let lease_path: PropPath = "@/clients/aa:bb:cc:dd:ee:01/ipv4".parse().unwrap();
        let expires = Utc::now() + Duration::hours(1);
        *root.descend_or_create(lease_path.segments()) =
            Node::expiring("192.168.2.50", expires);

        save(&path, &root).unwrap();
        let restored = load(&path).unwrap();
        assert_eq!(restored, root);
        assert_eq!(
            restored.descend(lease_path.segments()).unwrap().expires,
            Some(expires)
        );
    }

    #[test]
    fn tampered_document_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        let mut root = Node::default();
        *root.descend_or_create(&["siteid".into()]) = Node::leaf("7");
        save(&path, &root).unwrap();

        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"7\"", "\"8\"");
        std::fs::write(&path, tampered).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, TreeError::StoreHashMismatch { .. }));
    }

    #[test]
    fn missing_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = load_or_default(&dir.path().join("absent.json")).unwrap();
        assert!(root.is_empty());
    }
}
