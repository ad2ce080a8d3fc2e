#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for dhcp server metrics
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum MsgType {
        discover,
        request,
        decline,
        release,
        offer,
        ack,
        nak,
        inform,
        unknown,
    }
    pub struct RecvStats: IntCounter {
        "message_type" => MsgType
    }
    pub struct SentStats: IntCounter {
        "message_type" => MsgType
    }
}

lazy_static! {
    static ref RECV_VEC: IntCounterVec = register_int_counter_vec!(
        "dhcp_recv",
        "DHCP messages received",
        &["message_type"]
    )
    .unwrap();
    static ref SENT_VEC: IntCounterVec = register_int_counter_vec!(
        "dhcp_sent",
        "DHCP messages sent",
        &["message_type"]
    )
    .unwrap();

    /// received counters by message type
    pub static ref RECV: RecvStats = RecvStats::from(&RECV_VEC);
    /// sent counters by message type
    pub static ref SENT: SentStats = SentStats::from(&SENT_VEC);

    /// DISCOVERs that found no free slot
    pub static ref EXHAUSTED: IntCounterVec = register_int_counter_vec!(
        "dhcp_exhausted",
        "DISCOVERs that found the pool exhausted",
        &["ring"]
    )
    .unwrap();

    /// requests rejected because the client is on the wrong ring
    pub static ref BAD_RING: IntCounter =
        register_int_counter!("dhcp_bad_ring", "requests from a mismatched ring").unwrap();

    /// packets that failed to decode
    pub static ref MALFORMED: IntCounter =
        register_int_counter!("dhcp_malformed", "undecodable packets").unwrap();

    /// leases recovered from the config tree at startup
    pub static ref RECOVERED: IntCounter =
        register_int_counter!("dhcp_recovered", "leases recovered at startup").unwrap();
}
