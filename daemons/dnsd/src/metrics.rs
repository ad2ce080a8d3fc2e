#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! resolver and cache statistics
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// queries received, by transport and handler
    pub static ref QUERIES: IntCounterVec = register_int_counter_vec!(
        "dns_queries",
        "queries received",
        &["protocol", "handler"]
    )
    .unwrap();

    /// responses refused by ring visibility
    pub static ref VISIBILITY_REFUSED: IntCounter = register_int_counter!(
        "dns_visibility_refused",
        "local answers suppressed by ring visibility"
    )
    .unwrap();

    /// blocklisted lookups rewritten to the ring router
    pub static ref BLOCKED: IntCounter =
        register_int_counter!("dns_blocked", "blocklisted names rewritten").unwrap();

    /// cache lookups
    pub static ref CACHE_LOOKUPS: IntCounter =
        register_int_counter!("dns_cache_lookups", "cache lookups").unwrap();
    /// cache hits
    pub static ref CACHE_HITS: IntCounter =
        register_int_counter!("dns_cache_hits", "cache hits").unwrap();
    /// fingerprint collisions (not inserted / not served)
    pub static ref CACHE_COLLISIONS: IntCounter =
        register_int_counter!("dns_cache_collisions", "question fingerprint collisions").unwrap();
    /// bytes currently cached
    pub static ref CACHE_SIZE: IntGauge =
        register_int_gauge!("dns_cache_size_bytes", "bytes cached").unwrap();
    /// entries currently cached
    pub static ref CACHE_ENTRIES: IntGauge =
        register_int_gauge!("dns_cache_entries", "entries cached").unwrap();

    /// upstream exchanges by outcome
    pub static ref UPSTREAM: IntCounterVec = register_int_counter_vec!(
        "dns_upstream",
        "upstream exchanges",
        &["outcome"]
    )
    .unwrap();
}

/// hit rate over the life of the process
pub fn hit_rate() -> f64 {
    let lookups = CACHE_LOOKUPS.get();
    if lookups == 0 {
        return 0.0;
    }
    CACHE_HITS.get() as f64 / lookups as f64
}
