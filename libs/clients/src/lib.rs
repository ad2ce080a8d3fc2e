//! # clients
//!
//! Canonical per-MAC client state. The config tree owns the truth; every
//! daemon holds a [`Registry`] projection rebuilt from tree snapshots and
//! kept current by `sys.config` events. Mutations made locally must be
//! paired with a matching tree write -- the registry never invents state.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod record;
pub mod registry;

pub use record::{Client, Connection};
pub use registry::{Reaction, Registry};

use thiserror::Error;

/// Client-state failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// a MAC address failed to parse
    #[error("bad mac address: {0}")]
    BadMac(String),
    /// a tree value under `clients/` failed its typed accessor
    #[error("bad client field {field}: {reason}")]
    BadField {
        /// which field
        field: String,
        /// what was wrong
        reason: String,
    },
}
