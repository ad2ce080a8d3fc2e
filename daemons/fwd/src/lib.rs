//! # fwd
//!
//! Translates declarative rule files plus the ring topology into a
//! packet-filter ruleset. Rule files are parsed with a small pest grammar,
//! sorted most-specific-first, compiled into an `iptables-restore` document,
//! and applied in one bulk load so a failed apply leaves the previous
//! ruleset untouched. Compiling the same inputs twice produces bit-identical
//! output.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod apply;
pub mod compile;
pub mod parse;
pub mod rules;
pub mod server;

pub use compile::{Compiler, TypeMembers};
pub use rules::{Action, Endpoint, EndpointKind, Proto, Rule};

use thiserror::Error;

/// Firewall compilation and apply failures.
#[derive(Debug, Error)]
pub enum FwError {
    /// a rule line failed to parse
    #[error("rule parse error in {file}:{line}: {reason}")]
    Parse {
        /// file the rule came from
        file: String,
        /// 1-based line number
        line: usize,
        /// parser message
        reason: String,
    },
    /// a rule references a ring that is not configured
    #[error("rule references unconfigured ring {0}")]
    UnknownRing(String),
    /// rules dir or output io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// the bulk apply command failed; the previous ruleset is still loaded
    #[error("iptables-restore failed: {0}")]
    Apply(String),
    /// tree access failed
    #[error(transparent)]
    Tree(#[from] cfgtree::TreeError),
}
