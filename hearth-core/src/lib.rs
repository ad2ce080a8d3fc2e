//! # hearth-core
//!
//! Shared runtime pieces for the appliance daemons: CLI/trace configuration,
//! prometheus registries, the shutdown notifier, and the operator-log rate
//! limiter every daemon uses for peer-state exceptions.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use tokio;
pub use tracing;

pub mod config;
pub mod metrics;
pub mod prelude;
pub mod ratelimit;
pub mod shutdown;
