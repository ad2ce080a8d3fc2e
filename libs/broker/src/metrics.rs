#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! broker statistics
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// envelopes accepted for fan-out, by topic
    pub static ref PUBLISHED: IntCounterVec = register_int_counter_vec!(
        "broker_published",
        "envelopes accepted for fan-out",
        &["topic"]
    )
    .unwrap();

    /// envelopes dropped because a subscriber queue was full
    pub static ref DROPPED: IntCounter =
        register_int_counter!("broker_dropped", "envelopes dropped on full subscriber queues")
            .unwrap();

    /// currently connected subscribers
    pub static ref SUBSCRIBERS: IntGauge =
        register_int_gauge!("broker_subscribers", "connected subscribers").unwrap();

    /// client reconnect attempts
    pub static ref RECONNECTS: IntCounter =
        register_int_counter!("broker_reconnects", "client reconnect attempts").unwrap();
}
