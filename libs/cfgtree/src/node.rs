//! Tree nodes and property paths.
use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TreeError;

/// One node in the property tree. Values are strings; schemas for well-known
/// subtrees live next to the components that own them, which read through
/// [`Node::parse_value`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// the property value, if this node carries one
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    /// absolute expiry; the janitor removes the node once this passes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires: Option<DateTime<Utc>>,
    /// ordered children
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub children: BTreeMap<String, Node>,
}

impl Node {
    /// leaf with a value
    pub fn leaf(value: impl Into<String>) -> Self {
        Node {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// leaf with a value and an expiry
    pub fn expiring(value: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Node {
            value: Some(value.into()),
            expires: Some(expires),
            ..Default::default()
        }
    }

    /// Walk to a descendant.
    pub fn descend(&self, segments: &[String]) -> Option<&Node> {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.get(seg)?;
        }
        Some(cur)
    }

    /// Walk to a descendant, mutably.
    pub fn descend_mut(&mut self, segments: &[String]) -> Option<&mut Node> {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.get_mut(seg)?;
        }
        Some(cur)
    }

    /// Walk to a descendant, creating empty interior nodes along the way.
    pub fn descend_or_create(&mut self, segments: &[String]) -> &mut Node {
        let mut cur = self;
        for seg in segments {
            cur = cur.children.entry(seg.clone()).or_default();
        }
        cur
    }

    /// Typed accessor: parse the value, reporting path and reason on failure.
    pub fn parse_value<T>(&self, path: &PropPath) -> Result<T, TreeError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.value.as_deref().ok_or_else(|| TreeError::IllegalValue {
            path: path.to_string(),
            reason: "no value".into(),
        })?;
        raw.parse().map_err(|err| TreeError::IllegalValue {
            path: path.to_string(),
            reason: format!("{err}"),
        })
    }

    /// Feed this subtree into the hash in a canonical depth-first order.
    fn hash_into(&self, prefix: &str, hasher: &mut Sha256) {
        hasher.update(prefix.as_bytes());
        hasher.update(b"=");
        if let Some(v) = &self.value {
            hasher.update(v.as_bytes());
        }
        if let Some(exp) = &self.expires {
            hasher.update(b"@");
            hasher.update(exp.timestamp_millis().to_be_bytes());
        }
        hasher.update(b"\n");
        for (name, child) in &self.children {
            let child_prefix = format!("{prefix}/{name}");
            child.hash_into(&child_prefix, hasher);
        }
    }

    /// Hash of this subtree's canonical serialization.
    pub fn subtree_hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_into("@", &mut hasher);
        hex::encode(hasher.finalize())
    }

    /// number of nodes in this subtree, including self
    pub fn len(&self) -> usize {
        1 + self.children.values().map(Node::len).sum::<usize>()
    }

    /// true when the node has no value, no expiry, and no children
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.expires.is_none() && self.children.is_empty()
    }
}

/// A parsed property path. The canonical text form is `@/seg/seg/...`; the
/// bare root is `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PropPath {
    segments: Vec<String>,
}

impl PropPath {
    /// the tree root, `@`
    pub fn root() -> Self {
        Self { segments: vec![] }
    }

    /// build from segments
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// the path's segments below the root
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// true for the bare root `@`
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// child path
    pub fn join(&self, seg: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(seg.into());
        Self { segments }
    }

    /// parent path and final segment; `None` at the root
    pub fn split_last(&self) -> Option<(PropPath, &str)> {
        let (last, parents) = self.segments.split_last()?;
        Some((
            PropPath {
                segments: parents.to_vec(),
            },
            last,
        ))
    }
}

impl FromStr for PropPath {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| TreeError::BadPath(s.to_owned()))?;
        if rest.is_empty() {
            return Ok(PropPath::root());
        }
        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| TreeError::BadPath(s.to_owned()))?;
        let segments: Vec<String> = rest.trim_end_matches('/').split('/').map(String::from).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(TreeError::BadPath(s.to_owned()));
        }
        Ok(PropPath { segments })
    }
}

impl std::fmt::Display for PropPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("@");
        }
        write!(f, "@/{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for PropPath {
    type Error = TreeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PropPath> for String {
    fn from(p: PropPath) -> String {
        p.to_string()
    }
}
