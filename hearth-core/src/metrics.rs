#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! appliance-wide statistics; each daemon also registers its own
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    /// When the daemon started
    pub static ref START_TIME: Instant = Instant::now();

    /// net.exception events published, by reason
    pub static ref EXCEPTIONS_PUBLISHED: IntCounterVec = register_int_counter_vec!(
        "hearth_exceptions_published",
        "net.exception events published",
        &["reason"]
    )
    .unwrap();

    /// operator-visible peer errors suppressed by the rate limiter
    pub static ref EXCEPTIONS_SUPPRESSED: IntCounterVec = register_int_counter_vec!(
        "hearth_exceptions_suppressed",
        "peer errors suppressed by rate limiting",
        &["reason"]
    )
    .unwrap();
}

/// seconds since the daemon started
pub fn uptime() -> u64 {
    START_TIME.elapsed().as_secs()
}
