//! # procmon
//!
//! Child-process plumbing shared by the daemons: a wrapper that fans child
//! output into the structured logger and exposes signal/wait handles, a
//! deadman timer for stuck cleanup, and a pace tracker that turns restart
//! storms into a visible, bounded condition.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod child;
pub mod deadman;
pub mod pace;

pub use child::{ChildBuilder, ChildProcess, LogLevel};
pub use deadman::Deadman;
pub use pace::PaceTracker;

use thiserror::Error;

/// Process-control failures.
#[derive(Debug, Error)]
pub enum ProcError {
    /// spawn or pipe io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// signalling the child failed
    #[error("signal error: {0}")]
    Signal(#[from] nix::errno::Errno),
    /// child exited before we could use it
    #[error("child {0} already exited")]
    Gone(String),
}
