//! The in-memory tree: serialized mutation, snapshot reads, regex watches.
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use broker::event::ConfigCause;

use crate::{
    node::{Node, PropPath},
    ops::{Receipt, Transaction, TreeOp},
    TreeError,
};

/// A change notification delivered to watchers and mirrored onto the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEvent {
    /// change, delete, or expire
    pub cause: ConfigCause,
    /// the property path affected
    pub path: String,
    /// the new value; absent on delete/expire
    pub value: Option<String>,
    /// the property's expiry, if any
    pub expires: Option<DateTime<Utc>>,
    /// root hash after the commit
    pub hash: String,
    /// commit id of the transaction that produced this event
    pub cmd_id: u64,
    /// sender tag of that transaction
    pub sender: String,
}

impl ConfigEvent {
    /// the equivalent `sys.config` bus event
    pub fn to_broker_event(&self) -> broker::Event {
        broker::Event::ConfigChange {
            cause: self.cause,
            property: self.path.clone(),
            new_value: self.value.clone(),
            expires: self.expires,
            hash: self.hash.clone(),
        }
    }
}

struct Watcher {
    pattern: Regex,
    tx: mpsc::UnboundedSender<ConfigEvent>,
}

struct State {
    root: Node,
    hash: String,
    next_cmd: u64,
}

/// The property tree. One writer at a time; readers take subtree copies.
pub struct Tree {
    state: RwLock<State>,
    watchers: Mutex<Vec<Watcher>>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("tree lock poisoned");
        f.debug_struct("Tree")
            .field("hash", &state.hash)
            .field("next_cmd", &state.next_cmd)
            .field("nodes", &state.root.len())
            .finish()
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new(Node::default())
    }
}

impl Tree {
    /// Tree over an initial root (empty, or restored from the store).
    pub fn new(root: Node) -> Self {
        let hash = root.subtree_hash();
        Self {
            state: RwLock::new(State {
                root,
                hash,
                next_cmd: 1,
            }),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Register a watch. Events for every matching path arrive in commit
    /// order; the channel is unbounded so commit never blocks on a watcher.
    pub fn watch(&self, pattern: Regex) -> mpsc::UnboundedReceiver<ConfigEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("watcher lock poisoned")
            .push(Watcher { pattern, tx });
        rx
    }

    /// Register a watch from a pattern string, e.g. `^@/clients/.*`.
    pub fn watch_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<ConfigEvent>, TreeError> {
        let re = Regex::new(pattern).map_err(|err| TreeError::BadWatch(err.to_string()))?;
        Ok(self.watch(re))
    }

    /// Copy out a subtree, or None if the path is missing.
    pub fn get(&self, path: &PropPath) -> Option<Node> {
        let state = self.state.read().expect("tree lock poisoned");
        state.root.descend(path.segments()).cloned()
    }

    /// Read a single value.
    pub fn get_value(&self, path: &PropPath) -> Option<String> {
        let state = self.state.read().expect("tree lock poisoned");
        state
            .root
            .descend(path.segments())
            .and_then(|n| n.value.clone())
    }

    /// Snapshot of the whole tree.
    pub fn snapshot(&self) -> Node {
        self.state.read().expect("tree lock poisoned").root.clone()
    }

    /// Current root hash.
    pub fn hash(&self) -> String {
        self.state.read().expect("tree lock poisoned").hash.clone()
    }

    /// The id the next transaction will commit under.
    pub fn next_cmd_id(&self) -> u64 {
        self.state.read().expect("tree lock poisoned").next_cmd
    }

    /// Execute a transaction atomically. Ops are validated against a staged
    /// copy; the live tree and hash only move if every op succeeds, and
    /// watchers then see all of the transaction's events in order.
    pub fn execute(&self, tx: &Transaction) -> Result<Receipt, TreeError> {
        let mut state = self.state.write().expect("tree lock poisoned");
        let mut staged = state.root.clone();
        let mut payload = Vec::with_capacity(tx.ops.len());
        let mut pending = Vec::new();
        let mut mutated = false;

        for op in &tx.ops {
            match op {
                TreeOp::Get { path } => {
                    let node = staged
                        .descend(path.segments())
                        .cloned()
                        .ok_or_else(|| TreeError::NoSuchNode(path.to_string()))?;
                    payload.push(Some(node));
                }
                TreeOp::Create {
                    path,
                    value,
                    expires,
                } => {
                    let (parent, last) = path
                        .split_last()
                        .ok_or_else(|| TreeError::BadPath(path.to_string()))?;
                    let parent = staged.descend_or_create(parent.segments());
                    if parent.children.contains_key(last) {
                        return Err(TreeError::NodeExists(path.to_string()));
                    }
                    let mut node = Node::leaf(value.clone());
                    node.expires = *expires;
                    parent.children.insert(last.to_owned(), node);
                    pending.push((ConfigCause::Change, path.clone(), Some(value.clone()), *expires));
                    mutated = true;
                    payload.push(None);
                }
                TreeOp::Set {
                    path,
                    value,
                    expires,
                } => {
                    let node = staged
                        .descend_mut(path.segments())
                        .ok_or_else(|| TreeError::NoSuchNode(path.to_string()))?;
                    node.value = Some(value.clone());
                    node.expires = *expires;
                    pending.push((ConfigCause::Change, path.clone(), Some(value.clone()), *expires));
                    mutated = true;
                    payload.push(None);
                }
                TreeOp::Delete { path } => {
                    let (parent, last) = path
                        .split_last()
                        .ok_or_else(|| TreeError::BadPath(path.to_string()))?;
                    let parent = staged
                        .descend_mut(parent.segments())
                        .ok_or_else(|| TreeError::NoSuchNode(path.to_string()))?;
                    if parent.children.remove(last).is_none() {
                        return Err(TreeError::NoSuchNode(path.to_string()));
                    }
                    pending.push((ConfigCause::Delete, path.clone(), None, None));
                    mutated = true;
                    payload.push(None);
                }
                TreeOp::Test { path } => {
                    if staged.descend(path.segments()).is_none() {
                        return Err(TreeError::NoSuchNode(path.to_string()));
                    }
                    payload.push(None);
                }
                TreeOp::TestEq { path, value } => {
                    if path.is_root() {
                        // optimistic concurrency against the committed hash
                        if *value != state.hash {
                            return Err(TreeError::StaleHash {
                                expected: value.clone(),
                                actual: state.hash.clone(),
                            });
                        }
                    } else {
                        let node = staged
                            .descend(path.segments())
                            .ok_or_else(|| TreeError::NoSuchNode(path.to_string()))?;
                        if node.value.as_deref() != Some(value.as_str()) {
                            return Err(TreeError::ValueMismatch {
                                path: path.to_string(),
                                expected: value.clone(),
                                actual: node.value.clone(),
                            });
                        }
                    }
                    payload.push(None);
                }
                TreeOp::Ping => payload.push(None),
                TreeOp::Replace { path, subtree } => {
                    let old = if path.is_root() {
                        Some(std::mem::replace(&mut staged, subtree.clone()))
                    } else {
                        let (parent, last) = path.split_last().expect("non-root path splits");
                        let parent = staged.descend_or_create(parent.segments());
                        parent.children.insert(last.to_owned(), subtree.clone())
                    };
                    pending.push((
                        ConfigCause::Change,
                        path.clone(),
                        subtree.value.clone(),
                        subtree.expires,
                    ));
                    mutated = true;
                    payload.push(old);
                }
            }
        }

        // commit
        let cmd_id = state.next_cmd;
        state.next_cmd += 1;
        if mutated {
            state.hash = staged.subtree_hash();
            state.root = staged;
        }
        let hash = state.hash.clone();
        trace!(cmd_id, %hash, sender = %tx.sender, ops = tx.ops.len(), "committed");

        let events: Vec<ConfigEvent> = pending
            .into_iter()
            .map(|(cause, path, value, expires)| ConfigEvent {
                cause,
                path: path.to_string(),
                value,
                expires,
                hash: hash.clone(),
                cmd_id,
                sender: tx.sender.clone(),
            })
            .collect();
        drop(state);
        self.dispatch(&events);

        Ok(Receipt {
            cmd_id,
            hash,
            payload,
        })
    }

    /// Remove every node whose expiry has passed, synthesizing `expire`
    /// events. An expired interior node takes its subtree with it.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ConfigEvent> {
        let mut state = self.state.write().expect("tree lock poisoned");
        let mut expired = Vec::new();
        collect_expired(&state.root, &PropPath::root(), now, &mut expired);
        if expired.is_empty() {
            return Vec::new();
        }

        for path in &expired {
            if let Some((parent, last)) = path.split_last() {
                if let Some(parent) = state.root.descend_mut(parent.segments()) {
                    parent.children.remove(last);
                }
            }
        }
        let cmd_id = state.next_cmd;
        state.next_cmd += 1;
        state.hash = state.root.subtree_hash();
        let hash = state.hash.clone();
        debug!(count = expired.len(), "expired properties swept");

        let events: Vec<ConfigEvent> = expired
            .into_iter()
            .map(|path| ConfigEvent {
                cause: ConfigCause::Expire,
                path: path.to_string(),
                value: None,
                expires: None,
                hash: hash.clone(),
                cmd_id,
                sender: "janitor".into(),
            })
            .collect();
        drop(state);
        self.dispatch(&events);
        events
    }

    fn dispatch(&self, events: &[ConfigEvent]) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock().expect("watcher lock poisoned");
        watchers.retain(|w| {
            for ev in events {
                if w.pattern.is_match(&ev.path) && w.tx.send(ev.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }
}

fn collect_expired(node: &Node, path: &PropPath, now: DateTime<Utc>, out: &mut Vec<PropPath>) {
    if let Some(expires) = node.expires {
        if expires <= now && !path.is_root() {
            out.push(path.clone());
            return;
        }
    }
    for (name, child) in &node.children {
        collect_expired(child, &path.join(name.clone()), now, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn p(s: &str) -> PropPath {
        s.parse().unwrap()
    }

    fn set(tree: &Tree, path: &str, value: &str) -> Receipt {
        tree.execute(&Transaction::single(
            "test",
            TreeOp::Create {
                path: p(path),
                value: value.into(),
                expires: None,
            },
        ))
        .unwrap()
    }

    #[test]
    fn create_get_set_delete() {
        let tree = Tree::default();
        set(&tree, "@/clients/aa:bb:cc:dd:ee:01/ring", "unenrolled");

        assert_eq!(
            tree.get_value(&p("@/clients/aa:bb:cc:dd:ee:01/ring")).as_deref(),
            Some("unenrolled")
        );
        // create on an existing path fails
        let err = tree
            .execute(&Transaction::single(
                "test",
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:01/ring"),
                    value: "standard".into(),
                    expires: None,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, TreeError::NodeExists(_)));

        tree.execute(&Transaction::single(
            "test",
            TreeOp::Set {
                path: p("@/clients/aa:bb:cc:dd:ee:01/ring"),
                value: "standard".into(),
                expires: None,
            },
        ))
        .unwrap();
        assert_eq!(
            tree.get_value(&p("@/clients/aa:bb:cc:dd:ee:01/ring")).as_deref(),
            Some("standard")
        );

        tree.execute(&Transaction::single(
            "test",
            TreeOp::Delete {
                path: p("@/clients/aa:bb:cc:dd:ee:01"),
            },
        ))
        .unwrap();
        assert!(tree.get(&p("@/clients/aa:bb:cc:dd:ee:01")).is_none());
    }

    #[test]
    fn failed_op_rolls_back_whole_transaction() {
        let tree = Tree::default();
        set(&tree, "@/siteid", "1");
        let before = tree.hash();

        let err = tree.execute(&Transaction::new(
            "test",
            vec![
                TreeOp::Set {
                    path: p("@/siteid"),
                    value: "2".into(),
                    expires: None,
                },
                // missing path fails the whole transaction
                TreeOp::Set {
                    path: p("@/absent"),
                    value: "x".into(),
                    expires: None,
                },
            ],
        ));
        assert!(err.is_err());
        assert_eq!(tree.get_value(&p("@/siteid")).as_deref(), Some("1"));
        assert_eq!(tree.hash(), before);
    }

    #[test]
    fn watchers_see_all_or_none_in_commit_order() {
        let tree = Tree::default();
        let mut rx = tree.watch_pattern("^@/clients/.*").unwrap();

        // a failing tx must produce no events
        let _ = tree.execute(&Transaction::new(
            "test",
            vec![
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:01/ring"),
                    value: "guest".into(),
                    expires: None,
                },
                TreeOp::Test {
                    path: p("@/never/there"),
                },
            ],
        ));
        assert!(rx.try_recv().is_err());

        tree.execute(&Transaction::new(
            "dhcpd",
            vec![
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:01/ipv4"),
                    value: "192.168.2.50".into(),
                    expires: None,
                },
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:01/dhcp_name"),
                    value: "printer".into(),
                    expires: None,
                },
            ],
        ))
        .unwrap();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.path, "@/clients/aa:bb:cc:dd:ee:01/ipv4");
        assert_eq!(second.path, "@/clients/aa:bb:cc:dd:ee:01/dhcp_name");
        assert_eq!(first.cmd_id, second.cmd_id);
        assert_eq!(first.sender, "dhcpd");
    }

    #[test]
    fn root_testeq_gives_optimistic_concurrency() {
        let tree = Tree::default();
        set(&tree, "@/siteid", "1");
        let hash = tree.hash();

        // matching hash commits
        tree.execute(&Transaction::new(
            "cloud",
            vec![
                TreeOp::TestEq {
                    path: PropPath::root(),
                    value: hash.clone(),
                },
                TreeOp::Set {
                    path: p("@/siteid"),
                    value: "2".into(),
                    expires: None,
                },
            ],
        ))
        .unwrap();

        // the old hash is now stale
        let err = tree
            .execute(&Transaction::new(
                "cloud",
                vec![
                    TreeOp::TestEq {
                        path: PropPath::root(),
                        value: hash,
                    },
                    TreeOp::Set {
                        path: p("@/siteid"),
                        value: "3".into(),
                        expires: None,
                    },
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, TreeError::StaleHash { .. }));
        assert_eq!(tree.get_value(&p("@/siteid")).as_deref(), Some("2"));
    }

    #[test]
    fn sweep_removes_expired_and_tags_cause() {
        let tree = Tree::default();
        let past = Utc::now() - Duration::minutes(5);
        let future = Utc::now() + Duration::minutes(5);
        tree.execute(&Transaction::new(
            "dhcpd",
            vec![
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:01/ipv4"),
                    value: "192.168.2.50".into(),
                    expires: Some(past),
                },
                TreeOp::Create {
                    path: p("@/clients/aa:bb:cc:dd:ee:02/ipv4"),
                    value: "192.168.2.51".into(),
                    expires: Some(future),
                },
            ],
        ))
        .unwrap();
        let mut rx = tree.watch_pattern("^@/clients/.*").unwrap();

        let events = tree.sweep_expired(Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cause, ConfigCause::Expire);
        assert_eq!(events[0].path, "@/clients/aa:bb:cc:dd:ee:01/ipv4");
        assert!(tree.get(&p("@/clients/aa:bb:cc:dd:ee:01/ipv4")).is_none());
        // the unexpired sibling survives
        assert!(tree.get(&p("@/clients/aa:bb:cc:dd:ee:02/ipv4")).is_some());
        // watchers hear about it too
        assert_eq!(rx.try_recv().unwrap().cause, ConfigCause::Expire);
    }

    #[test]
    fn cmd_ids_are_monotonic_and_hash_moves_only_on_mutation() {
        let tree = Tree::default();
        let r1 = set(&tree, "@/a", "1");
        let h1 = tree.hash();
        let r2 = tree
            .execute(&Transaction::single("test", TreeOp::Ping))
            .unwrap();
        assert!(r2.cmd_id > r1.cmd_id);
        assert_eq!(tree.hash(), h1);
        let r3 = set(&tree, "@/b", "2");
        assert!(r3.cmd_id > r2.cmd_id);
        assert_ne!(tree.hash(), h1);
    }
}
