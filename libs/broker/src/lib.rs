//! # broker
//!
//! Topic-keyed pub/sub over a local unix socket. Published messages are
//! self-describing [`Envelope`]s tagged with timestamp, sender, and topic.
//! Publish is best-effort fire-and-forget; every subscriber gets its own
//! delivery queue drained by a single task, so a subscriber's handling of one
//! message always finishes before the next begins.
//!
//! Per-publisher per-topic ordering is preserved (one stream per client);
//! ordering between topics is not guaranteed. Clients reconnect with
//! exponential backoff and must tolerate losing messages buffered across a
//! disconnect.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod event;
pub mod metrics;
pub mod server;

pub use client::{BrokerClient, ClientConfig};
pub use event::{Envelope, Event, ExceptionReason, ResourceAction, Topic};
pub use server::Broker;

use thiserror::Error;

/// Broker transport and protocol failures
#[derive(Debug, Error)]
pub enum BrokerError {
    /// socket level failure
    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),
    /// a frame exceeded the line length cap or was not valid utf-8
    #[error("broker codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
    /// a frame was not valid JSON for the protocol
    #[error("broker frame error: {0}")]
    Frame(#[from] serde_json::Error),
    /// the first frame on a connection must be a hello
    #[error("expected hello frame from {0}")]
    ExpectedHello(String),
    /// the connection task has exited
    #[error("broker connection closed")]
    Closed,
}
