//! Topics and event bodies carried on the bus.
use std::{fmt, net::Ipv4Addr, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of topics used by the appliance core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// `sys.ping` liveness probes
    #[serde(rename = "sys.ping")]
    Ping,
    /// `sys.config` property tree changes
    #[serde(rename = "sys.config")]
    Config,
    /// `net.entity` client identity observations
    #[serde(rename = "net.entity")]
    Entity,
    /// `net.resource` lease claims and releases
    #[serde(rename = "net.resource")]
    Resource,
    /// `net.request` resolved DNS requests
    #[serde(rename = "net.request")]
    Request,
    /// `net.exception` peer-state errors
    #[serde(rename = "net.exception")]
    Exception,
    /// `net.scan` RF neighbour observations
    #[serde(rename = "net.scan")]
    Scan,
    /// `net.options` DHCP option evidence
    #[serde(rename = "net.options")]
    Options,
    /// `net.update` external list updates
    #[serde(rename = "net.update")]
    Update,
}

impl Topic {
    /// all topics, for subscribe-to-everything clients
    pub const ALL: [Topic; 9] = [
        Topic::Ping,
        Topic::Config,
        Topic::Entity,
        Topic::Resource,
        Topic::Request,
        Topic::Exception,
        Topic::Scan,
        Topic::Options,
        Topic::Update,
    ];

    /// the wire name of this topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Ping => "sys.ping",
            Topic::Config => "sys.config",
            Topic::Entity => "net.entity",
            Topic::Resource => "net.resource",
            Topic::Request => "net.request",
            Topic::Exception => "net.exception",
            Topic::Scan => "net.scan",
            Topic::Options => "net.options",
            Topic::Update => "net.update",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown topic {s}"))
    }
}

/// Why a lease resource event was published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    /// a client claimed a lease
    Claimed,
    /// a client released (or declined) a lease
    Released,
    /// an operator provisioned a static address
    Provisioned,
}

/// Reason tag on `net.exception` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionReason {
    /// a client resolved a name on the blocklist
    Phishing,
    /// repeated WPA authentication failures
    BadPassword,
    /// a DHCP request arrived on a ring that disagrees with the registry
    BadRing,
    /// a client is stuck in an EAP retransmit loop
    ClientRetransmit,
}

impl fmt::Display for ExceptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExceptionReason::Phishing => "phishing",
            ExceptionReason::BadPassword => "bad_password",
            ExceptionReason::BadRing => "bad_ring",
            ExceptionReason::ClientRetransmit => "client_retransmit",
        };
        f.write_str(s)
    }
}

/// Cause tag on config tree change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigCause {
    /// a value was created or changed
    Change,
    /// a node was deleted
    Delete,
    /// a node's expiration passed
    Expire,
}

/// One observed access point from an RF scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanObservation {
    /// BSSID of the neighbour
    pub bssid: String,
    /// primary 20 MHz channel
    pub channel: u32,
    /// occupied width in MHz (20/40/80)
    pub width_mhz: u32,
    /// signal strength in dBm
    pub signal_dbm: i32,
}

/// Event bodies. The envelope carries timestamp/sender/topic; these carry the
/// payload fields from the bus contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// liveness probe
    Ping {},
    /// property tree change notification
    ConfigChange {
        /// why the notification fired
        cause: ConfigCause,
        /// property path, e.g. `@/clients/aa:bb:cc:dd:ee:01/ipv4`
        property: String,
        /// the new value; absent on delete/expire
        new_value: Option<String>,
        /// absolute expiry, if the property carries one
        expires: Option<DateTime<Utc>>,
        /// root hash after the transaction
        hash: String,
    },
    /// a client was observed on the network
    Entity {
        /// hardware address, canonical lowercase form
        mac: String,
        /// ring the observation was made on, if known
        ring: Option<String>,
        /// virtual AP the station associated to
        vap: Option<String>,
        /// radio band ("2.4GHz"/"5GHz")
        band: Option<String>,
        /// IPv4 evidence, if any
        ipv4: Option<Ipv4Addr>,
        /// hostname the client supplied
        hostname: Option<String>,
        /// EAP username, when authenticated
        username: Option<String>,
        /// Wi-Fi taste signature, when computed
        signature: Option<String>,
        /// true when the station disconnected
        disconnect: bool,
    },
    /// a lease was claimed, released, or provisioned
    Resource {
        /// what happened
        action: ResourceAction,
        /// the address in question
        ipv4: Ipv4Addr,
        /// sanitized hostname, if the client supplied one
        hostname: Option<String>,
        /// lease duration in seconds, absent for static
        ttl_seconds: Option<u64>,
    },
    /// a DNS request was resolved
    Request {
        /// address the request came from
        requestor_ip: String,
        /// which handler answered ("local"/"proxy")
        debug_tag: String,
        /// wire protocol ("udp"/"tcp")
        protocol: String,
        /// question text
        request: Vec<String>,
        /// answer text
        response: Vec<String>,
    },
    /// a peer-state error worth the operator's attention
    Exception {
        /// classification
        reason: ExceptionReason,
        /// the client at fault
        mac: String,
        /// its address, if known
        ipv4: Option<Ipv4Addr>,
        /// supporting detail (hostname, expected vs actual ring, counts)
        details: Vec<String>,
    },
    /// RF neighbour scan results
    Scan {
        /// physical nic that scanned
        nic: String,
        /// everything heard
        aps: Vec<ScanObservation>,
    },
    /// DHCP option evidence for device identification
    Options {
        /// hardware address, canonical lowercase form
        mac: String,
        /// vendor class identifier, if supplied
        vendor: Option<String>,
        /// raw parameter request list
        params: Vec<u8>,
    },
    /// an external list (blocklist/allowlist) changed
    Update {
        /// tree path that changed
        path: String,
    },
}

/// A published message: the event plus who/when/where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// publication instant
    pub timestamp: DateTime<Utc>,
    /// publishing daemon
    pub sender: String,
    /// topic the event rides on
    pub topic: Topic,
    /// the payload
    pub event: Event,
}

impl Envelope {
    /// Tag an event for publication now.
    pub fn new(sender: impl Into<String>, topic: Topic, event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            sender: sender.into(),
            topic,
            event,
        }
    }
}

/// Frames exchanged on a broker connection. The first frame from a client
/// must be `hello`; everything after is `publish` in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Frame {
    /// client introduction + subscription list
    Hello(Hello),
    /// a published envelope
    Publish(Envelope),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub(crate) sender: String,
    pub(crate) subscribe: Vec<Topic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wire_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("net.nonsense".parse::<Topic>().is_err());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(
            "dhcpd",
            Topic::Resource,
            Event::Resource {
                action: ResourceAction::Claimed,
                ipv4: "192.168.2.50".parse().unwrap(),
                hostname: Some("printer".into()),
                ttl_seconds: Some(3600),
            },
        );
        let s = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&s).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn exception_reason_serializes_snake_case() {
        let s = serde_json::to_string(&ExceptionReason::BadRing).unwrap();
        assert_eq!(s, "\"bad_ring\"");
    }

    #[test]
    fn hello_frame_shape() {
        let frame = Frame::Hello(Hello {
            sender: "dnsd".into(),
            subscribe: vec![Topic::Config, Topic::Resource],
        });
        let s = serde_json::to_string(&frame).unwrap();
        assert!(s.contains("\"hello\""), "{s}");
        assert!(s.contains("sys.config"), "{s}");
    }
}
