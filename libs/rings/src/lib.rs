//! # rings
//!
//! The appliance's policy classes. A ring is a named class of clients with a
//! shared VLAN, subnet, and policy; every client belongs to exactly one.
//! This crate owns the ring table, the DNS visibility relation, the VAP map,
//! and the address-range math the DHCP handlers build on.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod wire;

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::Path, str::FromStr, time::Duration};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Downstream router nodes served on the `internal` ring; this many slots
/// are reserved at the bottom of every ring's range.
pub const MAX_SATELLITES: u32 = 4;

/// Config and validation failures for the ring table.
#[derive(Debug, Error)]
pub enum RingError {
    /// the ring name is not one of the predefined set
    #[error("unknown ring: {0}")]
    UnknownRing(String),
    /// the auth mode is not wpa-psk/wpa-eap/open
    #[error("unknown auth mode: {0}")]
    UnknownAuth(String),
    /// subnet failed to parse or is too small to hold the reservations
    #[error("bad subnet for ring {ring}: {reason}")]
    BadSubnet {
        /// which ring
        ring: String,
        /// what was wrong
        reason: String,
    },
    /// a VAP references a ring that is not configured
    #[error("vap {vap} references unconfigured ring {ring}")]
    DanglingVapRing {
        /// the vap
        vap: String,
        /// the missing ring
        ring: String,
    },
    /// config file io
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// config file decode
    #[error("config decode: {0}")]
    Decode(String),
}

/// The predefined set of rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ring {
    /// new clients awaiting identification
    Unenrolled,
    /// ordinary trusted clients
    Standard,
    /// IoT and appliances
    Devices,
    /// visitors
    Guest,
    /// isolated misbehaving clients
    Quarantine,
    /// the appliance's own services
    Core,
    /// satellite nodes
    Internal,
    /// VPN-terminated clients
    Vpn,
    /// initial appliance setup
    Setup,
    /// wired-only clients
    Wired,
}

impl Ring {
    /// every ring, iteration order = declaration order
    pub const ALL: [Ring; 10] = [
        Ring::Unenrolled,
        Ring::Standard,
        Ring::Devices,
        Ring::Guest,
        Ring::Quarantine,
        Ring::Core,
        Ring::Internal,
        Ring::Vpn,
        Ring::Setup,
        Ring::Wired,
    ];

    /// canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Ring::Unenrolled => "unenrolled",
            Ring::Standard => "standard",
            Ring::Devices => "devices",
            Ring::Guest => "guest",
            Ring::Quarantine => "quarantine",
            Ring::Core => "core",
            Ring::Internal => "internal",
            Ring::Vpn => "vpn",
            Ring::Setup => "setup",
            Ring::Wired => "wired",
        }
    }

    /// Privilege rank backing the DNS visibility relation.
    fn rank(&self) -> u8 {
        match self {
            Ring::Quarantine | Ring::Setup | Ring::Unenrolled => 0,
            Ring::Guest => 1,
            Ring::Devices | Ring::Wired => 2,
            Ring::Standard => 3,
            Ring::Vpn => 4,
            Ring::Internal => 5,
            Ring::Core => 6,
        }
    }

    /// Can a requester on this ring resolve records owned by `owner`?
    ///
    /// The relation is rank-based -- a requester sees records owned by rings
    /// at or below its own privilege -- with two carve-outs: quarantine and
    /// setup clients resolve only their own ring's records, whatever their
    /// rank relative to others.
    pub fn can_see(&self, owner: Ring) -> bool {
        if matches!(self, Ring::Quarantine | Ring::Setup) {
            return *self == owner;
        }
        self.rank() >= owner.rank()
    }

    /// Rings where the phishing blocklist is enforced. Core and internal are
    /// the appliance's own traffic; setup has no browsing clients.
    pub fn phish_enforced(&self) -> bool {
        !matches!(self, Ring::Core | Ring::Internal | Ring::Setup)
    }

    /// Rings that get NAT to the uplink and a forward-new rule.
    pub fn routes_to_wan(&self) -> bool {
        !matches!(self, Ring::Setup | Ring::Quarantine)
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ring {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ring::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| RingError::UnknownRing(s.to_owned()))
    }
}

/// How stations authenticate to a VAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// WPA2 pre-shared key
    WpaPsk,
    /// WPA2 enterprise (EAP through the local RADIUS server)
    WpaEap,
    /// no authentication
    Open,
}

impl AuthMode {
    /// canonical config-file name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::WpaPsk => "wpa-psk",
            AuthMode::WpaEap => "wpa-eap",
            AuthMode::Open => "open",
        }
    }
}

impl FromStr for AuthMode {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wpa-psk" => Ok(AuthMode::WpaPsk),
            "wpa-eap" => Ok(AuthMode::WpaEap),
            "open" => Ok(AuthMode::Open),
            other => Err(RingError::UnknownAuth(other.to_owned())),
        }
    }
}

/// One ring's validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// which ring this is
    pub ring: Ring,
    /// the ring's subnet
    pub subnet: Ipv4Net,
    /// 802.1q VLAN id
    pub vlan: u16,
    /// VAP serving this ring over the air, if any
    pub vap: Option<String>,
    /// how long dynamic leases run
    pub lease_duration: Duration,
    /// station authentication
    pub auth: AuthMode,
}

impl RingConfig {
    /// bridge interface the OS attaches this ring's traffic to
    pub fn bridge(&self) -> String {
        format!("brvlan{}", self.vlan)
    }

    /// the ring router (the appliance itself): first host in the subnet
    pub fn router(&self) -> Ipv4Addr {
        u32_ip(ip_u32(self.subnet.network()) + 1)
    }

    /// First leasable address: past the router and the satellite slots.
    pub fn range_start(&self) -> Ipv4Addr {
        u32_ip(ip_u32(self.subnet.network()) + 2 + MAX_SATELLITES)
    }

    /// Last leasable address: just short of broadcast.
    pub fn range_end(&self) -> Ipv4Addr {
        u32_ip(ip_u32(self.subnet.broadcast()) - 1)
    }

    /// usable slots between range_start and range_end inclusive
    pub fn range_span(&self) -> u32 {
        ip_u32(self.range_end())
            .saturating_sub(ip_u32(self.range_start()))
            .saturating_add(1)
    }

    /// address reserved for satellite node `n` (0-based)
    pub fn satellite_addr(&self, n: u32) -> Option<Ipv4Addr> {
        (n < MAX_SATELLITES).then(|| u32_ip(ip_u32(self.subnet.network()) + 2 + n))
    }

    /// is the address inside the leasable range?
    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        ip >= self.range_start() && ip <= self.range_end()
    }
}

fn ip_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

fn u32_ip(v: u32) -> Ipv4Addr {
    Ipv4Addr::from(v)
}

/// A virtual access point and the rings reachable through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VapConfig {
    /// vap name (e.g. `vap0`)
    pub name: String,
    /// broadcast SSID
    pub ssid: String,
    /// PSK passphrase when keymgmt is wpa-psk
    pub passphrase: Option<String>,
    /// station authentication for this SSID
    pub keymgmt: AuthMode,
    /// rings a station on this VAP can be assigned to
    pub rings: Vec<Ring>,
    /// ring a station lands on before identification
    pub default_ring: Ring,
}

/// Appliance-wide network block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// the appliance's DNS domain
    pub domainname: String,
    /// upstream resolver; `https://` prefix selects DoH
    pub dnsserver: String,
    /// uplink interface
    pub wan_iface: String,
    /// shared secret for the local RADIUS server
    pub radius_auth_secret: Option<String>,
    /// local-zone TTL
    pub local_ttl: Duration,
}

/// The validated appliance config: network block, ring table, VAP map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appliance {
    /// network block
    pub network: NetworkConfig,
    rings: BTreeMap<Ring, RingConfig>,
    vaps: BTreeMap<String, VapConfig>,
}

impl Appliance {
    /// Decode a config file: JSON first, then YAML.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, RingError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse_str(&raw)
    }

    /// Decode from a string: JSON first, then YAML.
    pub fn parse_str(raw: &str) -> Result<Self, RingError> {
        let wire: wire::Appliance = serde_json::from_str(raw)
            .or_else(|_| serde_yaml::from_str(raw))
            .map_err(|err: serde_yaml::Error| RingError::Decode(err.to_string()))?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: wire::Appliance) -> Result<Self, RingError> {
        let mut rings = BTreeMap::new();
        for (name, entry) in wire.rings {
            let ring: Ring = name.parse()?;
            let subnet: Ipv4Net = entry.subnet.parse().map_err(|err| RingError::BadSubnet {
                ring: name.clone(),
                reason: format!("{err}"),
            })?;
            let cfg = RingConfig {
                ring,
                subnet,
                vlan: entry.vlan,
                vap: entry.vap,
                lease_duration: Duration::from_secs(entry.lease_duration_secs),
                auth: entry
                    .auth
                    .as_deref()
                    .map(str::parse)
                    .transpose()?
                    .unwrap_or(AuthMode::WpaPsk),
            };
            // the range must survive the router + satellite reservations
            if cfg.range_span() == 0 || ip_u32(cfg.range_start()) >= ip_u32(subnet.broadcast()) {
                return Err(RingError::BadSubnet {
                    ring: name,
                    reason: format!("subnet {subnet} leaves no leasable addresses"),
                });
            }
            rings.insert(ring, cfg);
        }

        let mut vaps = BTreeMap::new();
        for (name, entry) in wire.vaps {
            let mut vap_rings = Vec::new();
            for rname in &entry.rings {
                let ring: Ring = rname.parse()?;
                if !rings.contains_key(&ring) {
                    return Err(RingError::DanglingVapRing {
                        vap: name.clone(),
                        ring: rname.clone(),
                    });
                }
                vap_rings.push(ring);
            }
            let default_ring: Ring = entry.default_ring.parse()?;
            vaps.insert(
                name.clone(),
                VapConfig {
                    name,
                    ssid: entry.ssid,
                    passphrase: entry.passphrase,
                    keymgmt: entry.keymgmt.parse()?,
                    rings: vap_rings,
                    default_ring,
                },
            );
        }

        Ok(Self {
            network: NetworkConfig {
                domainname: wire.network.domainname,
                dnsserver: wire.network.dnsserver,
                wan_iface: wire.network.wan_iface,
                radius_auth_secret: wire.network.radius_auth_secret,
                local_ttl: Duration::from_secs(u64::from(wire.network.local_ttl_secs)),
            },
            rings,
            vaps,
        })
    }

    /// one ring's config
    pub fn ring(&self, ring: Ring) -> Option<&RingConfig> {
        self.rings.get(&ring)
    }

    /// every configured ring
    pub fn rings(&self) -> impl Iterator<Item = &RingConfig> {
        self.rings.values()
    }

    /// the ring whose subnet contains `ip`
    pub fn ring_for_ip(&self, ip: Ipv4Addr) -> Option<&RingConfig> {
        self.rings.values().find(|r| r.subnet.contains(&ip))
    }

    /// the ring carried on `vlan`
    pub fn ring_for_vlan(&self, vlan: u16) -> Option<&RingConfig> {
        self.rings.values().find(|r| r.vlan == vlan)
    }

    /// one VAP's config
    pub fn vap(&self, name: &str) -> Option<&VapConfig> {
        self.vaps.get(name)
    }

    /// every configured VAP
    pub fn vaps(&self) -> impl Iterator<Item = &VapConfig> {
        self.vaps.values()
    }

    /// does any VAP authenticate via EAP?
    pub fn any_eap(&self) -> bool {
        self.vaps.values().any(|v| v.keymgmt == AuthMode::WpaEap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE_YAML: &str = r#"
network:
  domainname: example.net
  dnsserver: "8.8.8.8:53"
  wan_iface: wan0
  radius_auth_secret: hunter2
rings:
  unenrolled:
    subnet: "192.168.1.0/24"
    vlan: 1
    vap: vap0
    lease_duration_secs: 120
  standard:
    subnet: "192.168.2.0/24"
    vlan: 2
    vap: vap0
  devices:
    subnet: "192.168.3.0/24"
    vlan: 3
    vap: vap1
  quarantine:
    subnet: "192.168.9.0/24"
    vlan: 9
vaps:
  vap0:
    ssid: hearth
    passphrase: correcthorse
    keymgmt: wpa-psk
    rings: [unenrolled, standard]
    default_ring: unenrolled
  vap1:
    ssid: hearth-iot
    keymgmt: wpa-eap
    rings: [devices]
    default_ring: devices
"#;

    #[test]
    fn sample_parses_and_validates() {
        let cfg = Appliance::parse_str(SAMPLE_YAML).unwrap();
        let std_ring = cfg.ring(Ring::Standard).unwrap();
        assert_eq!(std_ring.vlan, 2);
        assert_eq!(std_ring.bridge(), "brvlan2");
        assert_eq!(std_ring.router(), Ipv4Addr::new(192, 168, 2, 1));
        // router + 4 satellite slots reserved
        assert_eq!(std_ring.range_start(), Ipv4Addr::new(192, 168, 2, 6));
        assert_eq!(std_ring.range_end(), Ipv4Addr::new(192, 168, 2, 254));
        assert_eq!(std_ring.range_span(), 249);
        assert!(cfg.any_eap());
        assert_eq!(
            cfg.ring_for_ip(Ipv4Addr::new(192, 168, 3, 77)).unwrap().ring,
            Ring::Devices
        );
    }

    #[test]
    fn dangling_vap_ring_rejected() {
        let bad = SAMPLE_YAML.replace("rings: [devices]", "rings: [devices, guest]");
        assert!(matches!(
            Appliance::parse_str(&bad),
            Err(RingError::DanglingVapRing { .. })
        ));
    }

    #[test]
    fn tiny_subnet_rejected() {
        let bad = SAMPLE_YAML.replace("192.168.9.0/24", "192.168.9.0/30");
        // /30 = 4 addrs; the router + satellite reservations leave none
        assert!(matches!(
            Appliance::parse_str(&bad),
            Err(RingError::BadSubnet { .. })
        ));
    }

    #[test]
    fn visibility_is_rank_ordered_with_carveouts() {
        // lower privilege cannot see higher
        assert!(!Ring::Guest.can_see(Ring::Standard));
        assert!(Ring::Standard.can_see(Ring::Guest));
        // core sees everything
        for ring in Ring::ALL {
            assert!(Ring::Core.can_see(ring));
        }
        // vpn sees standard-and-below but not core/internal
        assert!(Ring::Vpn.can_see(Ring::Standard));
        assert!(!Ring::Vpn.can_see(Ring::Core));
        assert!(!Ring::Vpn.can_see(Ring::Internal));
        // quarantine sees only itself
        assert!(Ring::Quarantine.can_see(Ring::Quarantine));
        assert!(!Ring::Quarantine.can_see(Ring::Unenrolled));
        assert!(!Ring::Quarantine.can_see(Ring::Guest));
    }

    #[test]
    fn ring_names_round_trip() {
        for ring in Ring::ALL {
            assert_eq!(ring.as_str().parse::<Ring>().unwrap(), ring);
        }
        assert!("dmz".parse::<Ring>().is_err());
    }
}
