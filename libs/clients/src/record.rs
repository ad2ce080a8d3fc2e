//! The client record and its config-tree encoding.
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

use cfgtree::{Node, PropPath, TreeOp};
use rings::Ring;

use crate::ClientError;

/// Parse a MAC into its canonical (lowercase, colon-separated) identity.
pub fn parse_mac(s: &str) -> Result<MacAddr, ClientError> {
    s.parse::<MacAddr>()
        .map_err(|_| ClientError::BadMac(s.to_owned()))
}

/// How (and whether) the client is currently attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// currently associated / on-link
    pub active: bool,
    /// appliance node it is attached to
    pub node: Option<String>,
    /// VAP it associated to, when wireless
    pub vap: Option<String>,
    /// radio band, when wireless
    pub band: Option<String>,
    /// true for Wi-Fi, false for wired
    pub wireless: bool,
}

/// One client: hardware address tied to lease, ring, names, and connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// identity
    pub mac: MacAddr,
    /// policy ring, once assigned
    pub ring: Option<Ring>,
    /// current lease address
    pub ipv4: Option<Ipv4Addr>,
    /// lease expiry; absent means static or unknown
    pub expires: Option<DateTime<Utc>>,
    /// operator-set DNS name
    pub dns_name: Option<String>,
    /// hostname from the last DHCP request
    pub dhcp_name: Option<String>,
    /// display name
    pub friendly_name: Option<String>,
    /// auto-derived unique DNS label
    pub friendly_dns: Option<String>,
    /// attachment state
    pub connection: Connection,
    /// home appliance for roaming setups
    pub home: Option<String>,
}

impl Client {
    /// fresh record for a newly observed MAC
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            ring: None,
            ipv4: None,
            expires: None,
            dns_name: None,
            dhcp_name: None,
            friendly_name: None,
            friendly_dns: None,
            connection: Connection::default(),
            home: None,
        }
    }

    /// `@/clients/<mac>`
    pub fn tree_path(&self) -> PropPath {
        client_path(&self.mac)
    }

    /// Encode as tree ops replacing `@/clients/<mac>` wholesale. Used by
    /// whoever creates the record; field-level updates go through
    /// finer-grained `Set`s so watchers see precise changes.
    pub fn to_replace_op(&self) -> TreeOp {
        let mut node = Node::default();
        let mut put = |name: &str, value: &Option<String>, expires: Option<DateTime<Utc>>| {
            if let Some(v) = value {
                let mut leaf = Node::leaf(v.clone());
                leaf.expires = expires;
                node.children.insert(name.to_owned(), leaf);
            }
        };
        put("ring", &self.ring.map(|r| r.to_string()), None);
        put("ipv4", &self.ipv4.map(|ip| ip.to_string()), self.expires);
        put("dns_name", &self.dns_name, None);
        put("dhcp_name", &self.dhcp_name, None);
        put("friendly_name", &self.friendly_name, None);
        put("friendly_dns", &self.friendly_dns, None);
        put("home", &self.home, None);

        let mut conn = Node::default();
        conn.children.insert(
            "active".into(),
            Node::leaf(if self.connection.active { "true" } else { "false" }),
        );
        conn.children.insert(
            "wireless".into(),
            Node::leaf(if self.connection.wireless { "true" } else { "false" }),
        );
        for (name, value) in [
            ("node", &self.connection.node),
            ("vap", &self.connection.vap),
            ("band", &self.connection.band),
        ] {
            if let Some(v) = value {
                conn.children.insert(name.to_owned(), Node::leaf(v.clone()));
            }
        }
        node.children.insert("connection".into(), conn);

        TreeOp::Replace {
            path: self.tree_path(),
            subtree: node,
        }
    }

    /// Decode from the `@/clients/<mac>` subtree.
    pub fn from_node(mac: MacAddr, node: &Node) -> Result<Self, ClientError> {
        let field = |name: &str| node.children.get(name).and_then(|n| n.value.clone());
        let ring = match field("ring") {
            Some(raw) => Some(raw.parse::<Ring>().map_err(|err| ClientError::BadField {
                field: "ring".into(),
                reason: err.to_string(),
            })?),
            None => None,
        };
        let (ipv4, expires) = match node.children.get("ipv4") {
            Some(n) => {
                let ip = match &n.value {
                    Some(raw) => {
                        Some(raw.parse::<Ipv4Addr>().map_err(|err| ClientError::BadField {
                            field: "ipv4".into(),
                            reason: err.to_string(),
                        })?)
                    }
                    None => None,
                };
                (ip, n.expires)
            }
            None => (None, None),
        };
        let conn = node.children.get("connection");
        let conn_field = |name: &str| {
            conn.and_then(|c| c.children.get(name))
                .and_then(|n| n.value.clone())
        };
        Ok(Client {
            mac,
            ring,
            ipv4,
            expires,
            dns_name: field("dns_name"),
            dhcp_name: field("dhcp_name"),
            friendly_name: field("friendly_name"),
            friendly_dns: field("friendly_dns"),
            home: field("home"),
            connection: Connection {
                active: conn_field("active").as_deref() == Some("true"),
                wireless: conn_field("wireless").as_deref() == Some("true"),
                node: conn_field("node"),
                vap: conn_field("vap"),
                band: conn_field("band"),
            },
        })
    }
}

/// `@/clients/<mac>` for a given MAC
pub fn client_path(mac: &MacAddr) -> PropPath {
    PropPath::from_segments(["clients".to_owned(), mac.to_string()])
}

/// `@/clients/<mac>/<field>`
pub fn client_field_path(mac: &MacAddr, field: &str) -> PropPath {
    client_path(mac).join(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_to_canonical_lowercase() {
        let mac = parse_mac("AA:BB:CC:DD:EE:01").unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
        assert!(parse_mac("not-a-mac").is_err());
    }

    #[test]
    fn record_round_trips_through_the_tree() {
        let mac = parse_mac("aa:bb:cc:dd:ee:01").unwrap();
        let mut client = Client::new(mac);
        client.ring = Some(Ring::Standard);
        client.ipv4 = Some("192.168.2.50".parse().unwrap());
        client.expires = Some(Utc::now() + chrono::Duration::hours(1));
        client.dhcp_name = Some("printer".into());
        client.friendly_name = Some("Front Desk Printer".into());
        client.connection = Connection {
            active: true,
            node: Some("gateway".into()),
            vap: Some("vap0".into()),
            band: Some("2.4GHz".into()),
            wireless: true,
        };

        let tree = cfgtree::Tree::default();
        tree.execute(&cfgtree::Transaction::single("test", client.to_replace_op()))
            .unwrap();
        let node = tree.get(&client.tree_path()).unwrap();
        let back = Client::from_node(mac, &node).unwrap();
        assert_eq!(back, client);
    }

    #[test]
    fn bad_ring_value_is_reported_not_swallowed() {
        let mac = parse_mac("aa:bb:cc:dd:ee:01").unwrap();
        let mut node = Node::default();
        node.children.insert("ring".into(), Node::leaf("dmz"));
        let err = Client::from_node(mac, &node).unwrap_err();
        assert!(matches!(err, ClientError::BadField { .. }));
    }
}
