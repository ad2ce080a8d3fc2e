//! Serde model for the appliance config file. The wire shapes are converted
//! into the validated typed model in `lib.rs`; nothing outside this crate
//! should touch these directly.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appliance {
    pub network: Network,
    pub rings: BTreeMap<String, RingEntry>,
    #[serde(default)]
    pub vaps: BTreeMap<String, VapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// the appliance's DNS domain
    pub domainname: String,
    /// upstream resolver; `https://` selects DNS-over-HTTPS
    pub dnsserver: String,
    /// interface facing the uplink
    pub wan_iface: String,
    /// shared secret for the local RADIUS server
    #[serde(default)]
    pub radius_auth_secret: Option<String>,
    /// local-zone TTL for synthesized records, seconds
    #[serde(default = "default_local_ttl")]
    pub local_ttl_secs: u32,
}

pub(crate) fn default_local_ttl() -> u32 {
    600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingEntry {
    pub subnet: String,
    pub vlan: u16,
    #[serde(default)]
    pub vap: Option<String>,
    #[serde(default = "default_lease_secs")]
    pub lease_duration_secs: u64,
    #[serde(default)]
    pub auth: Option<String>,
}

pub(crate) fn default_lease_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VapEntry {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    pub keymgmt: String,
    /// rings reachable through this VAP
    pub rings: Vec<String>,
    /// ring a station lands on before identification
    pub default_ring: String,
}
