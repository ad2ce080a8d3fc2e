//! The local zone: records synthesized from the client registry and
//! `@/dns/cnames`, answered subject to the ring visibility relation.
use std::{collections::HashMap, net::Ipv4Addr, sync::RwLock};

use hickory_proto::rr::RecordType;
use pnet::util::MacAddr;
use tracing::debug;

use cfgtree::Node;
use clients::Registry;
use rings::Ring;

/// One local record. `recval` is the A address, PTR target, or CNAME target
/// in text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// fully qualified lowercase name
    pub name: String,
    /// owning client, when derived from the registry
    pub mac: Option<MacAddr>,
    /// ring that owns the record; drives visibility
    pub host_ring: Ring,
    /// A, PTR, or CNAME
    pub rectype: RecordType,
    /// the record value in text form
    pub recval: String,
}

/// Forward and reverse maps for the local zone.
#[derive(Debug, Default)]
pub struct HostTable {
    inner: RwLock<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    /// fqdn -> record (A or CNAME)
    forward: HashMap<String, DnsRecord>,
    /// reverse name (x.y.z.w.in-addr.arpa.) -> record (PTR)
    reverse: HashMap<String, DnsRecord>,
}

/// `50.2.168.192.in-addr.arpa.` for 192.168.2.50
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
}

fn fqdn(label: &str, domain: &str) -> String {
    format!("{}.{}.", label.to_lowercase(), domain.trim_end_matches('.'))
}

impl HostTable {
    /// empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the zone from the registry plus the `@/dns/cnames` subtree.
    /// Clients contribute an A record for each name they carry (operator
    /// `dns_name` first, then `friendly_dns`, then `dhcp_name`) and a PTR
    /// for their address pointing at the most authoritative of those names.
    pub fn rebuild(&self, registry: &Registry, domain: &str, cnames: Option<&Node>) {
        let mut maps = Maps::default();

        for client in registry.snapshot() {
            let Some(ring) = client.ring else { continue };
            let names: Vec<&String> = [
                client.dns_name.as_ref(),
                client.friendly_dns.as_ref(),
                client.dhcp_name.as_ref(),
            ]
            .into_iter()
            .flatten()
            .collect();
            let Some(ip) = client.ipv4 else { continue };

            for label in &names {
                let name = fqdn(label, domain);
                maps.forward.entry(name.clone()).or_insert(DnsRecord {
                    name,
                    mac: Some(client.mac),
                    host_ring: ring,
                    rectype: RecordType::A,
                    recval: ip.to_string(),
                });
            }
            if let Some(label) = names.first() {
                let rname = reverse_name(ip);
                maps.reverse.insert(
                    rname.clone(),
                    DnsRecord {
                        name: rname,
                        mac: Some(client.mac),
                        host_ring: ring,
                        rectype: RecordType::PTR,
                        recval: fqdn(label, domain),
                    },
                );
            }
        }

        if let Some(cnames) = cnames {
            for (alias, node) in &cnames.children {
                let Some(target) = &node.value else { continue };
                let name = fqdn(alias, domain);
                let mut recval = target.trim_end_matches('.').to_lowercase();
                recval.push('.');
                maps.forward.insert(
                    name.clone(),
                    DnsRecord {
                        name,
                        mac: None,
                        // operator aliases rank lowest so every ring resolves them
                        host_ring: Ring::Unenrolled,
                        rectype: RecordType::CNAME,
                        recval,
                    },
                );
            }
        }

        let (fwd, rev) = (maps.forward.len(), maps.reverse.len());
        *self.inner.write().expect("host table lock poisoned") = maps;
        debug!(forward = fwd, reverse = rev, "local zone rebuilt");
    }

    /// Look up a forward name for a requester ring. `None` means the name
    /// does not exist; `Some(None)` means it exists but visibility denies it
    /// (answer empty NOERROR).
    pub fn lookup(&self, name: &str, requester: Ring) -> Option<Option<DnsRecord>> {
        let key = name.to_lowercase();
        let maps = self.inner.read().expect("host table lock poisoned");
        let record = maps.forward.get(&key)?;
        if !requester.can_see(record.host_ring) {
            return Some(None);
        }
        Some(Some(record.clone()))
    }

    /// Reverse lookup, same visibility contract as [`HostTable::lookup`].
    pub fn lookup_ptr(&self, rname: &str, requester: Ring) -> Option<Option<DnsRecord>> {
        let key = rname.to_lowercase();
        let maps = self.inner.read().expect("host table lock poisoned");
        let record = maps.reverse.get(&key)?;
        if !requester.can_see(record.host_ring) {
            return Some(None);
        }
        Some(Some(record.clone()))
    }

    /// every assigned forward name, for collision checks
    pub fn forward_names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("host table lock poisoned")
            .forward
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clients::Client;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    fn registry_with_printer() -> Registry {
        let registry = Registry::new();
        let mut c = Client::new(mac(1));
        c.ring = Some(Ring::Unenrolled);
        c.ipv4 = Some(Ipv4Addr::new(192, 168, 2, 50));
        c.dns_name = Some("printer".into());
        registry.insert(c);
        registry
    }

    #[test]
    fn records_follow_visibility() {
        let table = HostTable::new();
        table.rebuild(&registry_with_printer(), "example.net", None);

        // standard can see unenrolled records
        let hit = table
            .lookup("printer.example.net.", Ring::Standard)
            .expect("record exists")
            .expect("visible");
        assert_eq!(hit.recval, "192.168.2.50");
        assert_eq!(hit.rectype, RecordType::A);

        // quarantine cannot: exists but refused
        assert_eq!(table.lookup("printer.example.net.", Ring::Quarantine), Some(None));

        // missing name is missing
        assert!(table.lookup("absent.example.net.", Ring::Core).is_none());
    }

    #[test]
    fn ptr_synthesis_matches_forward() {
        let table = HostTable::new();
        table.rebuild(&registry_with_printer(), "example.net", None);
        let ptr = table
            .lookup_ptr(&reverse_name(Ipv4Addr::new(192, 168, 2, 50)), Ring::Standard)
            .unwrap()
            .unwrap();
        assert_eq!(ptr.recval, "printer.example.net.");
    }

    #[test]
    fn cnames_come_from_the_tree() {
        let table = HostTable::new();
        let mut cnames = Node::default();
        cnames
            .children
            .insert("www".into(), Node::leaf("gateway.example.net"));
        table.rebuild(&Registry::new(), "example.net", Some(&cnames));
        let rec = table
            .lookup("www.example.net.", Ring::Standard)
            .unwrap()
            .unwrap();
        assert_eq!(rec.rectype, RecordType::CNAME);
        assert_eq!(rec.recval, "gateway.example.net.");
    }

    #[test]
    fn name_priority_prefers_operator_dns_name() {
        let registry = Registry::new();
        let mut c = Client::new(mac(2));
        c.ring = Some(Ring::Standard);
        c.ipv4 = Some(Ipv4Addr::new(192, 168, 2, 60));
        c.dns_name = Some("named".into());
        c.dhcp_name = Some("hostname".into());
        registry.insert(c);
        let table = HostTable::new();
        table.rebuild(&registry, "example.net", None);
        let ptr = table
            .lookup_ptr(&reverse_name(Ipv4Addr::new(192, 168, 2, 60)), Ring::Core)
            .unwrap()
            .unwrap();
        assert_eq!(ptr.recval, "named.example.net.");
        // both names resolve forward
        assert!(table.lookup("hostname.example.net.", Ring::Core).is_some());
    }
}
