//! Transaction operations and receipts.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{Node, PropPath};

/// One operation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TreeOp {
    /// copy out a subtree
    Get {
        /// subtree root
        path: PropPath,
    },
    /// create a property; fails if the path exists
    Create {
        /// property path
        path: PropPath,
        /// value to store
        value: String,
        /// optional absolute expiry
        expires: Option<DateTime<Utc>>,
    },
    /// set a property; fails if the path does not exist
    Set {
        /// property path
        path: PropPath,
        /// value to store
        value: String,
        /// optional absolute expiry
        expires: Option<DateTime<Utc>>,
    },
    /// remove a subtree
    Delete {
        /// subtree root
        path: PropPath,
    },
    /// fail the transaction unless the path exists
    Test {
        /// property path
        path: PropPath,
    },
    /// fail the transaction unless the value matches; at `@` the value is
    /// compared against the root hash (optimistic concurrency)
    TestEq {
        /// property path, or `@` for the root hash
        path: PropPath,
        /// asserted value
        value: String,
    },
    /// no-op used for liveness and ordering probes
    Ping,
    /// replace a whole subtree, creating it if missing
    Replace {
        /// subtree root
        path: PropPath,
        /// replacement subtree
        subtree: Node,
    },
}

impl TreeOp {
    /// does this op mutate the tree?
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            TreeOp::Create { .. } | TreeOp::Set { .. } | TreeOp::Delete { .. } | TreeOp::Replace { .. }
        )
    }
}

/// An atomic group of operations. Subscribers see all of a transaction's
/// effects or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// the operations, applied in order
    pub ops: Vec<TreeOp>,
    /// who sent it; carried into change notifications
    pub sender: String,
}

impl Transaction {
    /// transaction with a single op
    pub fn single(sender: impl Into<String>, op: TreeOp) -> Self {
        Self {
            ops: vec![op],
            sender: sender.into(),
        }
    }

    /// transaction from a list of ops
    pub fn new(sender: impl Into<String>, ops: Vec<TreeOp>) -> Self {
        Self {
            ops,
            sender: sender.into(),
        }
    }
}

/// What a committed transaction returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// monotonically increasing command id
    pub cmd_id: u64,
    /// root hash after the transaction
    pub hash: String,
    /// one entry per op: `Get`/`Replace` return the (old) subtree, others None
    pub payload: Vec<Option<Node>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_know_their_mutability() {
        let path: PropPath = "@/siteid".parse().unwrap();
        assert!(TreeOp::Create {
            path: path.clone(),
            value: "1".into(),
            expires: None
        }
        .is_mutation());
        assert!(!TreeOp::Get { path: path.clone() }.is_mutation());
        assert!(!TreeOp::TestEq {
            path,
            value: "x".into()
        }
        .is_mutation());
        assert!(!TreeOp::Ping.is_mutation());
    }

    #[test]
    fn transaction_round_trips_through_json() {
        let tx = Transaction::new(
            "dhcpd",
            vec![
                TreeOp::Test {
                    path: "@/clients/aa:bb:cc:dd:ee:01".parse().unwrap(),
                },
                TreeOp::Set {
                    path: "@/clients/aa:bb:cc:dd:ee:01/ipv4".parse().unwrap(),
                    value: "192.168.2.50".into(),
                    expires: Some(Utc::now()),
                },
            ],
        );
        let s = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&s).unwrap();
        assert_eq!(back, tx);
    }
}
