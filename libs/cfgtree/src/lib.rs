//! # cfgtree
//!
//! The appliance's authoritative shared state: a single rooted tree of
//! string-keyed nodes, each optionally carrying a value and an expiration
//! instant. Mutations ride in atomic [`Transaction`]s with monotonically
//! increasing command ids; the root hash advances on every successful
//! mutation and backs optimistic concurrency via [`TreeOp::TestEq`] at `@`.
//!
//! Subscribers register regex watches over property paths and see either all
//! or none of a transaction's effects, in commit order. Expiration is a
//! first-class cause: a janitor synthesizes `expire` events, which clients
//! must treat as recoverable (unlike `delete`, which is terminal).
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod handle;
pub mod janitor;
pub mod node;
pub mod ops;
pub mod server;
pub mod store;
pub mod tree;

pub use handle::ConfigHandle;
pub use node::{Node, PropPath};
pub use ops::{Receipt, Transaction, TreeOp};
pub use server::CfgServer;
pub use tree::{ConfigEvent, Tree};

use thiserror::Error;

/// Failures surfaced by tree operations. Configuration errors are recovered
/// at the caller; the transaction fails atomically.
#[derive(Debug, Error)]
pub enum TreeError {
    /// create on an existing path
    #[error("node already exists: {0}")]
    NodeExists(String),
    /// set/delete/test on a missing path
    #[error("no such node: {0}")]
    NoSuchNode(String),
    /// test-equal failed
    #[error("value mismatch at {path}: expected {expected:?}, found {actual:?}")]
    ValueMismatch {
        /// property path tested
        path: String,
        /// value the caller asserted
        expected: String,
        /// value actually stored
        actual: Option<String>,
    },
    /// a path did not parse (`@/` root, non-empty segments)
    #[error("bad property path: {0}")]
    BadPath(String),
    /// a watch pattern did not compile
    #[error("bad watch pattern: {0}")]
    BadWatch(String),
    /// test-equal against the root hash failed; the tree moved underneath
    #[error("stale root hash: expected {expected}, tree is at {actual}")]
    StaleHash {
        /// hash the caller had
        expected: String,
        /// hash the tree is at
        actual: String,
    },
    /// a stored value failed its typed accessor
    #[error("illegal value at {path}: {reason}")]
    IllegalValue {
        /// property path read
        path: String,
        /// what was wrong with it
        reason: String,
    },
    /// persisted document hash did not match its contents
    #[error("store hash mismatch: document says {stored}, contents hash to {computed}")]
    StoreHashMismatch {
        /// hash recorded in the document
        stored: String,
        /// hash recomputed on load
        computed: String,
    },
    /// store/transport io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// store/transport encoding
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// remote execute failed or the server went away
    #[error("config server error: {0}")]
    Server(String),
}
