//! # dhcpd
//!
//! One lease handler per ring. Each handler owns a slot-indexed pool carved
//! from the ring's subnet (router and satellite slots reserved), serialized
//! by its own mutex. Requests are processed inline by the ring's read task;
//! successful claims are written to the config tree and announced as
//! `net.resource` events, so DNS and the rest of the appliance follow along
//! without ever touching this daemon's internals.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod handler;
pub mod hostname;
pub mod metrics;
pub mod pool;
pub mod server;

pub use handler::{DhcpServer, RingHandler};
pub use pool::{Lease, LeasePool};

use thiserror::Error;

/// DHCP-side failures. Peer-induced conditions (wrong ring, exhausted pool)
/// are not errors; they are NAKs and `net.exception` events.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// socket setup or io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// packet failed to decode; logged and dropped
    #[error("malformed packet: {0}")]
    Malformed(String),
    /// a tree write failed
    #[error(transparent)]
    Tree(#[from] cfgtree::TreeError),
    /// the ring this handler serves has no configuration
    #[error("ring {0} is not configured")]
    NoRingConfig(rings::Ring),
}
