//! # dnsd
//!
//! Split-horizon resolver. The local zone is synthesized from the client
//! registry and `@/dns/cnames`, filtered per requester ring by the
//! visibility relation; everything else is proxied upstream (classic UDP or
//! DNS-over-HTTPS) through a TTL-respecting cache. Phishing-enforced rings
//! get blocklisted names rewritten to their ring router.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod blocklist;
pub mod cache;
pub mod friendly;
pub mod local;
pub mod metrics;
pub mod proxy;
pub mod server;

pub use cache::ResponseCache;
pub use local::HostTable;
pub use server::DnsServer;

use thiserror::Error;

/// DNS-side failures. Malformed peer packets are dropped, not erred.
#[derive(Debug, Error)]
pub enum DnsError {
    /// socket io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// wire encode/decode
    #[error("proto error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
    /// upstream exchange failed
    #[error("upstream error: {0}")]
    Upstream(String),
    /// tree access failed
    #[error(transparent)]
    Tree(#[from] cfgtree::TreeError),
}
