//! Channel selection by observed RF congestion.
//!
//! Every neighbouring AP adds `100 + signal_dBm` to each 20 MHz channel it
//! occupies; wider channels are estimated as the sum of their constituent
//! 20 MHz entries. On 2.4 GHz only the non-overlapping channels (1, 6, 11)
//! are candidates. Ties go to the lowest-numbered channel.
use std::collections::BTreeMap;

use tracing::debug;

use broker::event::ScanObservation;

use crate::device::{Band, DeviceCaps};

/// the non-overlapping 2.4 GHz channels
pub const LOW_BAND_PREFERRED: [u32; 3] = [1, 6, 11];

/// Per-20MHz-channel congestion estimates.
#[derive(Debug, Default, Clone)]
pub struct Congestion {
    load: BTreeMap<u32, i64>,
}

/// 20 MHz channels an AP at `primary` with `width_mhz` occupies. 5 GHz
/// channel numbers step by 4 per 20 MHz.
fn occupied(primary: u32, width_mhz: u32, band: Band) -> Vec<u32> {
    let step = match band {
        Band::Low => 4,
        Band::High => 4,
    };
    match width_mhz {
        80 => (0..4).map(|i| primary + i * step).collect(),
        40 => vec![primary, primary + step],
        _ => vec![primary],
    }
}

impl Congestion {
    /// empty estimate
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one scan pass into the estimate.
    pub fn observe(&mut self, aps: &[ScanObservation]) {
        for ap in aps {
            let band = if ap.channel <= 14 { Band::Low } else { Band::High };
            let weight = i64::from(100 + ap.signal_dbm);
            for ch in occupied(ap.channel, ap.width_mhz, band) {
                *self.load.entry(ch).or_default() += weight.max(0);
            }
        }
    }

    /// congestion on one 20 MHz channel
    pub fn level(&self, channel: u32) -> i64 {
        self.load.get(&channel).copied().unwrap_or(0)
    }

    /// congestion across a (possibly wide) channel
    pub fn level_wide(&self, primary: u32, width_mhz: u32, band: Band) -> i64 {
        occupied(primary, width_mhz, band)
            .into_iter()
            .map(|ch| self.level(ch))
            .sum()
    }

    /// forget everything (a fresh scan pass replaces the estimate)
    pub fn reset(&mut self) {
        self.load.clear();
    }
}

/// Pick a channel for a device on a band: an operator override wins when
/// the device supports it; otherwise the least-congested candidate, lowest
/// channel number on ties.
pub fn pick_channel(
    caps: &DeviceCaps,
    band: Band,
    congestion: &Congestion,
    override_channel: Option<u32>,
) -> Option<u32> {
    if let Some(ch) = override_channel {
        if caps.supports_channel(band, ch) {
            return Some(ch);
        }
        debug!(channel = ch, %band, dev = %caps.name, "override unsupported, choosing automatically");
    }
    let supported = caps.channels.get(&band)?;
    let candidates: Vec<u32> = if band == Band::Low {
        let preferred: Vec<u32> = LOW_BAND_PREFERRED
            .iter()
            .copied()
            .filter(|ch| supported.contains(ch))
            .collect();
        if preferred.is_empty() {
            supported.clone()
        } else {
            preferred
        }
    } else {
        supported.clone()
    };

    candidates
        .into_iter()
        .map(|ch| (congestion.level(ch), ch))
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, ch)| ch)
}

/// Parse `iw dev <nic> scan` output into observations.
pub fn parse_scan(output: &str) -> Vec<ScanObservation> {
    let mut aps = Vec::new();
    let mut bssid = None;
    let mut freq = None;
    let mut signal = None;
    let mut width = 20;

    let mut flush = |bssid: &mut Option<String>,
                     freq: &mut Option<u32>,
                     signal: &mut Option<i32>,
                     width: &mut u32,
                     aps: &mut Vec<ScanObservation>| {
        if let (Some(b), Some(f), Some(s)) = (bssid.take(), freq.take(), signal.take()) {
            let channel = freq_to_channel(f);
            aps.push(ScanObservation {
                bssid: b,
                channel,
                width_mhz: *width,
                signal_dbm: s,
            });
        }
        *width = 20;
    };

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("BSS ") {
            flush(&mut bssid, &mut freq, &mut signal, &mut width, &mut aps);
            bssid = Some(rest.split('(').next().unwrap_or(rest).trim().to_owned());
        } else if let Some(rest) = trimmed.strip_prefix("freq: ") {
            freq = rest.split('.').next().unwrap_or(rest).parse().ok();
        } else if let Some(rest) = trimmed.strip_prefix("signal: ") {
            signal = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.split('.').next())
                .and_then(|s| s.parse().ok());
        } else if trimmed.contains("STA channel width: 40 MHz") || trimmed.contains("secondary channel offset: above")
        {
            width = 40;
        } else if trimmed.contains("* channel width: 1 (80 MHz)") {
            width = 80;
        }
    }
    flush(&mut bssid, &mut freq, &mut signal, &mut width, &mut aps);
    aps
}

/// IEEE channel number for a frequency in MHz.
pub fn freq_to_channel(freq: u32) -> u32 {
    match freq {
        2412..=2472 => (freq - 2407) / 5,
        2484 => 14,
        _ => (freq.saturating_sub(5000)) / 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn low_band_dev() -> DeviceCaps {
        let mut channels = BTreeMap::new();
        channels.insert(Band::Low, (1..=11).collect::<Vec<u32>>());
        DeviceCaps {
            name: "wlan0".into(),
            mac: pnet::util::MacAddr::zero(),
            bands: BTreeSet::from([Band::Low]),
            channels,
            max_vifs: 4,
            vlan_support: true,
            ht: true,
            vht: false,
        }
    }

    #[test]
    fn neighbours_on_six_push_selection_to_one() {
        let mut congestion = Congestion::new();
        // two APs on channel 6 at -40 dBm: 2 * (100 - 40) = 120
        congestion.observe(&[
            ScanObservation {
                bssid: "aa:aa:aa:aa:aa:01".into(),
                channel: 6,
                width_mhz: 20,
                signal_dbm: -40,
            },
            ScanObservation {
                bssid: "aa:aa:aa:aa:aa:02".into(),
                channel: 6,
                width_mhz: 20,
                signal_dbm: -40,
            },
        ]);
        assert_eq!(congestion.level(6), 120);
        assert_eq!(congestion.level(1), 0);
        assert_eq!(congestion.level(11), 0);
        // 1 and 11 tie at zero; the lowest-numbered wins
        assert_eq!(
            pick_channel(&low_band_dev(), Band::Low, &congestion, None),
            Some(1)
        );
    }

    #[test]
    fn wide_channels_sum_their_constituents() {
        let mut congestion = Congestion::new();
        congestion.observe(&[ScanObservation {
            bssid: "aa:aa:aa:aa:aa:03".into(),
            channel: 36,
            width_mhz: 80,
            signal_dbm: -50,
        }]);
        // the 80 MHz AP loads 36, 40, 44, 48 at 50 each
        for ch in [36, 40, 44, 48] {
            assert_eq!(congestion.level(ch), 50);
        }
        assert_eq!(congestion.level_wide(36, 80, Band::High), 200);
        assert_eq!(congestion.level(52), 0);
    }

    #[test]
    fn override_wins_when_supported() {
        let congestion = Congestion::new();
        assert_eq!(
            pick_channel(&low_band_dev(), Band::Low, &congestion, Some(11)),
            Some(11)
        );
        // unsupported override falls back to automatic choice
        assert_eq!(
            pick_channel(&low_band_dev(), Band::Low, &congestion, Some(13)),
            Some(1)
        );
    }

    #[test]
    fn scan_parse_reads_iw_output() {
        let output = r#"
BSS aa:bb:cc:00:00:01(on wlan0)
	freq: 2437
	signal: -40.00 dBm
	SSID: neighbour
BSS aa:bb:cc:00:00:02(on wlan0)
	freq: 5180
	signal: -55.00 dBm
	SSID: other
"#;
        let aps = parse_scan(output);
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[0].channel, 6);
        assert_eq!(aps[0].signal_dbm, -40);
        assert_eq!(aps[1].channel, 36);
        assert_eq!(aps[1].signal_dbm, -55);
    }

    #[test]
    fn freq_mapping_matches_ieee_numbering() {
        assert_eq!(freq_to_channel(2412), 1);
        assert_eq!(freq_to_channel(2437), 6);
        assert_eq!(freq_to_channel(2462), 11);
        assert_eq!(freq_to_channel(2484), 14);
        assert_eq!(freq_to_channel(5180), 36);
        assert_eq!(freq_to_channel(5745), 149);
    }
}
