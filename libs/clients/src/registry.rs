//! The process-wide registry: one mutex around the whole map.
//!
//! Lock ordering: when a daemon must hold both this lock and one of its own
//! (a DHCP handler, the DNS hosts map), it takes the registry lock first.
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use tracing::{debug, warn};

use cfgtree::{ConfigEvent, Node};
use rings::Ring;

use broker::event::ConfigCause;

use crate::record::{parse_mac, Client};

/// What a config event means for the daemon hosting this registry. The
/// registry applies the state change; the daemon drives the side effects
/// (release a lease, rewrite the VLAN map, drop DNS records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// `ipv4` changed: notify DHCP and DNS
    AddressChanged {
        /// which client
        mac: MacAddr,
        /// the new address
        ipv4: Ipv4Addr,
        /// its expiry; absent means static assignment
        expires: Option<DateTime<Utc>>,
    },
    /// `ipv4` expired (recoverable; the client remains)
    AddressExpired {
        /// which client
        mac: MacAddr,
    },
    /// `ring` changed: rewrite mac-VLAN mapping, disassociate the station
    RingChanged {
        /// which client
        mac: MacAddr,
        /// the ring it moved to
        ring: Ring,
    },
    /// `friendly_name` changed: re-derive `friendly_dns`
    FriendlyNameChanged {
        /// which client
        mac: MacAddr,
    },
    /// the whole client was deleted (terminal): cascade cleanup
    Deleted {
        /// which client
        mac: MacAddr,
    },
    /// some other field changed; state was updated, nothing else to do
    Updated {
        /// which client
        mac: MacAddr,
    },
}

/// `mac -> client`, guarded by a single mutex.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<HashMap<MacAddr, Client>>,
}

impl Registry {
    /// empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a `@/clients` subtree snapshot. Records that fail to
    /// decode are logged and skipped rather than poisoning the rest.
    pub fn load_snapshot(&self, clients: &Node) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.clear();
        for (mac_str, node) in &clients.children {
            let mac = match parse_mac(mac_str) {
                Ok(mac) => mac,
                Err(err) => {
                    warn!(%mac_str, ?err, "skipping client with bad mac");
                    continue;
                }
            };
            match Client::from_node(mac, node) {
                Ok(client) => {
                    inner.insert(mac, client);
                }
                Err(err) => warn!(%mac, ?err, "skipping undecodable client"),
            }
        }
        debug!(count = inner.len(), "registry loaded");
    }

    /// Look up a client by MAC (copy).
    pub fn get(&self, mac: &MacAddr) -> Option<Client> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(mac)
            .cloned()
    }

    /// Insert or overwrite a record.
    pub fn insert(&self, client: Client) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(client.mac, client);
    }

    /// Update one record in place; inserts a fresh record when absent.
    pub fn update<F>(&self, mac: MacAddr, f: F)
    where
        F: FnOnce(&mut Client),
    {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let client = inner.entry(mac).or_insert_with(|| Client::new(mac));
        f(client);
    }

    /// Remove a record.
    pub fn remove(&self, mac: &MacAddr) -> Option<Client> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(mac)
    }

    /// Copy of every record.
    pub fn snapshot(&self) -> Vec<Client> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// number of known clients
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// true when no clients are known
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a `sys.config` event for a `@/clients/...` path, returning what
    /// the hosting daemon should do about it. Non-client paths return None.
    pub fn apply_config_event(&self, ev: &ConfigEvent) -> Option<Reaction> {
        let mut parts = ev.path.strip_prefix("@/")?.split('/');
        if parts.next()? != "clients" {
            return None;
        }
        let mac = parse_mac(parts.next()?).ok()?;
        let field = parts.next();

        match (ev.cause, field) {
            // whole-client delete is terminal
            (ConfigCause::Delete, None) => {
                self.remove(&mac);
                Some(Reaction::Deleted { mac })
            }
            // address expiry is recoverable; the client stays
            (ConfigCause::Expire, Some("ipv4")) => {
                self.update(mac, |c| {
                    c.ipv4 = None;
                    c.expires = None;
                });
                Some(Reaction::AddressExpired { mac })
            }
            (ConfigCause::Change, Some("ipv4")) => {
                let ipv4: Ipv4Addr = ev.value.as_deref()?.parse().ok()?;
                self.update(mac, |c| {
                    c.ipv4 = Some(ipv4);
                    c.expires = ev.expires;
                });
                Some(Reaction::AddressChanged {
                    mac,
                    ipv4,
                    expires: ev.expires,
                })
            }
            (ConfigCause::Delete, Some("ipv4")) => {
                self.update(mac, |c| {
                    c.ipv4 = None;
                    c.expires = None;
                });
                Some(Reaction::Updated { mac })
            }
            (ConfigCause::Change, Some("ring")) => {
                let ring: Ring = ev.value.as_deref()?.parse().ok()?;
                self.update(mac, |c| c.ring = Some(ring));
                Some(Reaction::RingChanged { mac, ring })
            }
            (ConfigCause::Change, Some("friendly_name")) => {
                self.update(mac, |c| c.friendly_name = ev.value.clone());
                Some(Reaction::FriendlyNameChanged { mac })
            }
            (ConfigCause::Change, Some("friendly_dns")) => {
                self.update(mac, |c| c.friendly_dns = ev.value.clone());
                Some(Reaction::Updated { mac })
            }
            (ConfigCause::Change, Some("dns_name")) => {
                self.update(mac, |c| c.dns_name = ev.value.clone());
                Some(Reaction::Updated { mac })
            }
            (ConfigCause::Change, Some("dhcp_name")) => {
                self.update(mac, |c| c.dhcp_name = ev.value.clone());
                Some(Reaction::Updated { mac })
            }
            // connection subtree and anything else: keep a record exists
            (ConfigCause::Change, Some(_)) => {
                self.update(mac, |_| {});
                Some(Reaction::Updated { mac })
            }
            _ => Some(Reaction::Updated { mac }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::event::ConfigCause;

    fn ev(cause: ConfigCause, path: &str, value: Option<&str>) -> ConfigEvent {
        ConfigEvent {
            cause,
            path: path.into(),
            value: value.map(String::from),
            expires: None,
            hash: "h".into(),
            cmd_id: 1,
            sender: "test".into(),
        }
    }

    #[test]
    fn address_change_and_expire_are_distinct() {
        let reg = Registry::new();
        let mac = parse_mac("aa:bb:cc:dd:ee:01").unwrap();

        let reaction = reg
            .apply_config_event(&ev(
                ConfigCause::Change,
                "@/clients/aa:bb:cc:dd:ee:01/ipv4",
                Some("192.168.2.50"),
            ))
            .unwrap();
        assert!(matches!(reaction, Reaction::AddressChanged { .. }));
        assert_eq!(
            reg.get(&mac).unwrap().ipv4,
            Some("192.168.2.50".parse().unwrap())
        );

        // expire clears the address but keeps the client
        let reaction = reg
            .apply_config_event(&ev(
                ConfigCause::Expire,
                "@/clients/aa:bb:cc:dd:ee:01/ipv4",
                None,
            ))
            .unwrap();
        assert!(matches!(reaction, Reaction::AddressExpired { .. }));
        let client = reg.get(&mac).unwrap();
        assert_eq!(client.ipv4, None);

        // delete of the whole client is terminal
        let reaction = reg
            .apply_config_event(&ev(ConfigCause::Delete, "@/clients/aa:bb:cc:dd:ee:01", None))
            .unwrap();
        assert!(matches!(reaction, Reaction::Deleted { .. }));
        assert!(reg.get(&mac).is_none());
    }

    #[test]
    fn ring_change_reports_new_ring() {
        let reg = Registry::new();
        let reaction = reg
            .apply_config_event(&ev(
                ConfigCause::Change,
                "@/clients/aa:bb:cc:dd:ee:01/ring",
                Some("quarantine"),
            ))
            .unwrap();
        assert_eq!(
            reaction,
            Reaction::RingChanged {
                mac: parse_mac("aa:bb:cc:dd:ee:01").unwrap(),
                ring: Ring::Quarantine
            }
        );
    }

    #[test]
    fn non_client_paths_are_ignored() {
        let reg = Registry::new();
        assert!(reg
            .apply_config_event(&ev(ConfigCause::Change, "@/rings/standard/subnet", Some("x")))
            .is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_load_replaces_contents() {
        let reg = Registry::new();
        let tree = cfgtree::Tree::default();
        let mac = parse_mac("aa:bb:cc:dd:ee:01").unwrap();
        let mut client = Client::new(mac);
        client.ring = Some(Ring::Devices);
        tree.execute(&cfgtree::Transaction::single("t", client.to_replace_op()))
            .unwrap();

        let clients = tree
            .get(&"@/clients".parse().unwrap())
            .expect("clients subtree exists");
        reg.load_snapshot(&clients);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&mac).unwrap().ring, Some(Ring::Devices));
    }
}
