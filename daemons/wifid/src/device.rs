//! Radio capabilities, state evaluation, and band assignment.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use pnet::util::MacAddr;
use tracing::debug;

/// Radio band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Band {
    /// 2.4 GHz
    Low,
    /// 5 GHz
    High,
}

impl Band {
    /// both bands, low first
    pub const ALL: [Band; 2] = [Band::Low, Band::High];

    /// display name used in events and the config tree
    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Low => "2.4GHz",
            Band::High => "5GHz",
        }
    }

    /// band a frequency (MHz) belongs to
    pub fn of_freq(freq: u32) -> Band {
        if freq < 3000 {
            Band::Low
        } else {
            Band::High
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Band {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2.4GHz" => Ok(Band::Low),
            "5GHz" => Ok(Band::High),
            other => Err(format!("unknown band {other}")),
        }
    }
}

/// What we know about one physical radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    /// interface name (e.g. `wlan0`)
    pub name: String,
    /// hardware address
    pub mac: MacAddr,
    /// bands with at least one usable channel
    pub bands: BTreeSet<Band>,
    /// usable channels per band
    pub channels: BTreeMap<Band, Vec<u32>>,
    /// how many virtual interfaces the driver can host
    pub max_vifs: u32,
    /// AP/VLAN interface support
    pub vlan_support: bool,
    /// 802.11n
    pub ht: bool,
    /// 802.11ac
    pub vht: bool,
}

impl DeviceCaps {
    /// does the device support this channel on this band?
    pub fn supports_channel(&self, band: Band, channel: u32) -> bool {
        self.channels
            .get(&band)
            .map(|chs| chs.contains(&channel))
            .unwrap_or(false)
    }
}

/// Operator intent for one radio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// pinned band
    pub cfg_band: Option<Band>,
    /// pinned channel
    pub cfg_channel: Option<u32>,
    /// pinned width
    pub cfg_width: Option<u32>,
    /// taken out of service
    pub disabled: bool,
}

/// Evaluated device state, written to the config tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// configuration is legal and supported
    Ok,
    /// operator disabled
    Disabled,
    /// the configured band does not exist
    IllegalBand,
    /// the configured channel is not a real channel for the band
    IllegalChannel,
    /// the device cannot serve the configured band
    UnsupportedBand,
    /// the device cannot serve the configured channel
    UnsupportedChannel,
    /// no channel could be chosen at all
    NoChannel,
    /// the chosen channel stopped working
    BadChannel,
}

impl DeviceState {
    /// tree value
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Ok => "ok",
            DeviceState::Disabled => "disabled",
            DeviceState::IllegalBand => "illegal-band",
            DeviceState::IllegalChannel => "illegal-channel",
            DeviceState::UnsupportedBand => "unsupported-band",
            DeviceState::UnsupportedChannel => "unsupported-channel",
            DeviceState::NoChannel => "no-channel",
            DeviceState::BadChannel => "bad-channel",
        }
    }
}

/// legal channel numbers per band, independent of any device
fn legal_channel(band: Band, channel: u32) -> bool {
    match band {
        Band::Low => (1..=14).contains(&channel),
        Band::High => (32..=177).contains(&channel),
    }
}

/// Evaluate operator intent against hardware reality.
pub fn evaluate(caps: &DeviceCaps, cfg: &DeviceConfig) -> DeviceState {
    if cfg.disabled {
        return DeviceState::Disabled;
    }
    if let Some(band) = cfg.cfg_band {
        if !caps.bands.contains(&band) {
            return DeviceState::UnsupportedBand;
        }
        if let Some(channel) = cfg.cfg_channel {
            if !legal_channel(band, channel) {
                return DeviceState::IllegalChannel;
            }
            if !caps.supports_channel(band, channel) {
                return DeviceState::UnsupportedChannel;
            }
        }
    } else if let Some(channel) = cfg.cfg_channel {
        // a channel with no band only makes sense if some band carries it
        if !Band::ALL.iter().any(|b| legal_channel(*b, channel)) {
            return DeviceState::IllegalChannel;
        }
        if !Band::ALL
            .iter()
            .any(|b| caps.supports_channel(*b, channel))
        {
            return DeviceState::UnsupportedChannel;
        }
    }
    if caps.bands.is_empty() {
        return DeviceState::NoChannel;
    }
    DeviceState::Ok
}

/// Score a (device, band) pairing. `None` means ineligible: serving a ring
/// topology needs VLAN interfaces and at least two virtual APs.
pub fn score(caps: &DeviceCaps, band: Band) -> Option<i32> {
    if !caps.vlan_support || caps.max_vifs < 2 || !caps.bands.contains(&band) {
        return None;
    }
    let mut score = 0;
    // we always want one low-band radio for range
    if band == Band::Low {
        score += 10;
    }
    if caps.ht {
        score += 1;
    }
    if caps.vht && band == Band::High {
        score += 2;
    }
    Some(score)
}

/// Choose at most one device per band maximizing the total score. Ties
/// break on the lower MAC address so the choice is stable across runs.
pub fn select_devices<'a>(devices: &'a [DeviceCaps]) -> BTreeMap<Band, &'a DeviceCaps> {
    let candidates = |band: Band| {
        let mut scored: Vec<(&DeviceCaps, i32)> = devices
            .iter()
            .filter_map(|d| score(d, band).map(|s| (d, s)))
            .collect();
        scored.sort_by(|(da, sa), (db, sb)| sb.cmp(sa).then_with(|| da.mac.cmp(&db.mac)));
        scored
    };
    let low = candidates(Band::Low);
    let high = candidates(Band::High);

    // exhaustive over the small candidate sets: best total with distinct
    // devices per band
    let mut best: (i32, Option<&DeviceCaps>, Option<&DeviceCaps>) = (i32::MIN, None, None);
    for low_pick in std::iter::once(None).chain(low.iter().map(Some)) {
        for high_pick in std::iter::once(None).chain(high.iter().map(Some)) {
            if let (Some((dl, _)), Some((dh, _))) = (low_pick, high_pick) {
                if std::ptr::eq(*dl, *dh) {
                    continue;
                }
            }
            let total = low_pick.map(|(_, s)| *s).unwrap_or(0)
                + high_pick.map(|(_, s)| *s).unwrap_or(0)
                // prefer assigning radios at all
                + low_pick.map(|_| 1).unwrap_or(0)
                + high_pick.map(|_| 1).unwrap_or(0);
            let better = total > best.0
                || (total == best.0
                    && tie_mac(low_pick, high_pick) < tie_mac_pair(&best));
            if better {
                best = (total, low_pick.map(|(d, _)| *d), high_pick.map(|(d, _)| *d));
            }
        }
    }

    let mut out = BTreeMap::new();
    if let Some(d) = best.1 {
        out.insert(Band::Low, d);
    }
    if let Some(d) = best.2 {
        out.insert(Band::High, d);
    }
    debug!(
        low = out.get(&Band::Low).map(|d| d.name.as_str()),
        high = out.get(&Band::High).map(|d| d.name.as_str()),
        "band assignment"
    );
    out
}

type Pick<'a> = Option<&'a (&'a DeviceCaps, i32)>;

fn tie_mac(low: Pick<'_>, high: Pick<'_>) -> (MacAddr, MacAddr) {
    (
        low.map(|(d, _)| d.mac).unwrap_or(MacAddr::broadcast()),
        high.map(|(d, _)| d.mac).unwrap_or(MacAddr::broadcast()),
    )
}

fn tie_mac_pair(best: &(i32, Option<&DeviceCaps>, Option<&DeviceCaps>)) -> (MacAddr, MacAddr) {
    (
        best.1.map(|d| d.mac).unwrap_or(MacAddr::broadcast()),
        best.2.map(|d| d.mac).unwrap_or(MacAddr::broadcast()),
    )
}

/// Parse `iw phy` style capability output into device records. Each `Wiphy`
/// block contributes one device; frequencies marked disabled are skipped.
pub fn parse_capabilities(output: &str, names: &BTreeMap<String, MacAddr>) -> Vec<DeviceCaps> {
    let mut devices = Vec::new();
    let mut current: Option<DeviceCaps> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(phy) = trimmed.strip_prefix("Wiphy ") {
            if let Some(dev) = current.take() {
                devices.push(dev);
            }
            let name = phy.trim().to_owned();
            let mac = names.get(&name).copied().unwrap_or(MacAddr::zero());
            current = Some(DeviceCaps {
                name,
                mac,
                bands: BTreeSet::new(),
                channels: BTreeMap::new(),
                max_vifs: 1,
                vlan_support: false,
                ht: false,
                vht: false,
            });
            continue;
        }
        let Some(dev) = current.as_mut() else { continue };

        if trimmed.starts_with("Capabilities:") {
            dev.ht = true;
        } else if trimmed.starts_with("VHT Capabilities") {
            dev.vht = true;
        } else if trimmed == "* AP/VLAN" {
            dev.vlan_support = true;
        } else if trimmed.contains("#{ AP") && trimmed.contains("<=") {
            // "#{ AP } <= 8," style combination limits
            if let Some(num) = trimmed
                .rsplit("<=")
                .next()
                .and_then(|n| n.trim().trim_end_matches(',').parse().ok())
            {
                dev.max_vifs = num;
            }
        } else if trimmed.starts_with('*') && trimmed.contains(" MHz [") {
            if trimmed.contains("(disabled)") {
                continue;
            }
            let freq: Option<u32> = trimmed
                .trim_start_matches('*')
                .trim()
                .split(' ')
                .next()
                .and_then(|f| f.parse().ok());
            let channel: Option<u32> = trimmed
                .split('[')
                .nth(1)
                .and_then(|s| s.split(']').next())
                .and_then(|c| c.parse().ok());
            if let (Some(freq), Some(channel)) = (freq, channel) {
                let band = Band::of_freq(freq);
                dev.bands.insert(band);
                dev.channels.entry(band).or_default().push(channel);
            }
        }
    }
    if let Some(dev) = current.take() {
        devices.push(dev);
    }
    devices
}
