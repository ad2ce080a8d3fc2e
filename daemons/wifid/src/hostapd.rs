//! hostapd file generation: the per-device main config, the per-VAP VLAN
//! list and mac-to-VLAN (PSK) files, and the RADIUS client list and EAP
//! user database used when any VAP runs wpa-eap.
use std::{fmt::Write as _, path::PathBuf};

use md4::{Digest, Md4};

use clients::Registry;
use rings::{Appliance, AuthMode, VapConfig};

use crate::device::Band;

/// where hostapd's control sockets live
pub const CTRL_DIR: &str = "/var/run/hostapd";

/// `/tmp/hostapd.conf.<nic>`
pub fn conf_path(nic: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/hostapd.conf.{nic}"))
}

/// `/tmp/hostapd.<nic>.<vap>.vlan`
pub fn vlan_path(nic: &str, vap: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/hostapd.{nic}.{vap}.vlan"))
}

/// `/tmp/hostapd.<nic>.<vap>.macs`
pub fn macs_path(nic: &str, vap: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/hostapd.{nic}.{vap}.macs"))
}

/// hostapd `hw_mode` for a band
fn hw_mode(band: Band) -> &'static str {
    match band {
        Band::Low => "g",
        Band::High => "a",
    }
}

/// bss interface name for the nth VAP on a nic
pub fn bss_ifname(nic: &str, index: usize) -> String {
    if index == 0 {
        nic.to_owned()
    } else {
        format!("{nic}.{index}")
    }
}

/// Generate the main hostapd config for one device serving `vaps`.
pub fn main_conf(
    appliance: &Appliance,
    nic: &str,
    band: Band,
    channel: u32,
    ht: bool,
    vht: bool,
    vaps: &[&VapConfig],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# generated by wifid, do not edit");
    let _ = writeln!(out, "ctrl_interface={CTRL_DIR}");
    let _ = writeln!(out, "hw_mode={}", hw_mode(band));
    let _ = writeln!(out, "channel={channel}");
    if ht {
        let _ = writeln!(out, "ieee80211n=1");
    }
    if vht && band == Band::High {
        let _ = writeln!(out, "ieee80211ac=1");
    }
    let _ = writeln!(out, "country_code=US");

    for (idx, vap) in vaps.iter().enumerate() {
        let ifname = bss_ifname(nic, idx);
        if idx == 0 {
            let _ = writeln!(out, "interface={ifname}");
        } else {
            let _ = writeln!(out);
            let _ = writeln!(out, "bss={ifname}");
        }
        let _ = writeln!(out, "ssid={}", vap.ssid);
        let _ = writeln!(out, "vlan_file={}", vlan_path(nic, &vap.name).display());
        let _ = writeln!(out, "dynamic_vlan=1");
        match vap.keymgmt {
            AuthMode::WpaPsk => {
                let _ = writeln!(out, "wpa=2");
                let _ = writeln!(out, "wpa_key_mgmt=WPA-PSK");
                let _ = writeln!(out, "rsn_pairwise=CCMP");
                if let Some(pass) = &vap.passphrase {
                    let _ = writeln!(out, "wpa_passphrase={pass}");
                }
                let _ = writeln!(out, "wpa_psk_file={}", macs_path(nic, &vap.name).display());
            }
            AuthMode::WpaEap => {
                let _ = writeln!(out, "wpa=2");
                let _ = writeln!(out, "wpa_key_mgmt=WPA-EAP");
                let _ = writeln!(out, "rsn_pairwise=CCMP");
                let _ = writeln!(out, "ieee8021x=1");
                let _ = writeln!(out, "auth_server_addr=127.0.0.1");
                let _ = writeln!(out, "auth_server_port=1812");
                if let Some(secret) = &appliance.network.radius_auth_secret {
                    let _ = writeln!(out, "auth_server_shared_secret={secret}");
                }
            }
            AuthMode::Open => {}
        }
    }
    out
}

/// The VLAN list: one named VLAN subinterface per ring reachable from the
/// VAP, so hostapd pre-creates them and the OS attaches them to bridges.
pub fn vlan_file(appliance: &Appliance, nic: &str, vap: &VapConfig) -> String {
    let mut out = String::new();
    for ring in &vap.rings {
        if let Some(cfg) = appliance.ring(*ring) {
            let _ = writeln!(out, "{} vlan{}.{}", cfg.vlan, cfg.vlan, nic);
        }
    }
    out
}

/// The mac-to-VLAN map (hostapd `wpa_psk_file` format): every known client
/// reachable through this VAP pinned to the numeric VLAN of its ring.
/// Clients without a ring fall to the VAP's default ring.
pub fn macs_file(appliance: &Appliance, registry: &Registry, vap: &VapConfig) -> String {
    let Some(pass) = vap.passphrase.as_deref() else {
        return String::new();
    };
    let mut lines: Vec<String> = Vec::new();
    for client in registry.snapshot() {
        let ring = client.ring.unwrap_or(vap.default_ring);
        if !vap.rings.contains(&ring) {
            continue;
        }
        let Some(cfg) = appliance.ring(ring) else { continue };
        lines.push(format!("vlanid={} {} {}", cfg.vlan, client.mac, pass));
    }
    lines.sort();
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// RADIUS client list for the local server.
pub fn radius_clients(appliance: &Appliance) -> String {
    let secret = appliance
        .network
        .radius_auth_secret
        .as_deref()
        .unwrap_or_default();
    format!("127.0.0.1/32\t{secret}\n")
}

/// NT password hash (MD4 over UTF-16LE) for the hostapd EAP user database.
pub fn nt_hash(password: &str) -> String {
    let utf16: Vec<u8> = password
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    hex::encode(Md4::digest(&utf16))
}

/// The EAP user database: one MSCHAPv2 entry per (uid, password).
pub fn eap_users(users: &[(String, String)]) -> String {
    let mut out = String::new();
    for (uid, password) in users {
        let _ = writeln!(out, "\"{uid}\"\tMSCHAPV2\thash:{}\t[2]", nt_hash(password));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clients::Client;
    use pnet::util::MacAddr;
    use rings::Ring;
    use std::sync::Arc;

    const SAMPLE: &str = r#"
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
  standard:
    subnet: "192.168.2.0/24"
    vlan: 2
    vap: vap0
vaps:
  vap0:
    ssid: hearth
    passphrase: correcthorse
    keymgmt: wpa-psk
    rings: [unenrolled, standard]
    default_ring: unenrolled
"#;

    fn appliance() -> Arc<Appliance> {
        Arc::new(Appliance::parse_str(SAMPLE).unwrap())
    }

    #[test]
    fn main_conf_carries_the_radio_and_bss_sections() {
        let app = appliance();
        let vap = app.vap("vap0").unwrap();
        let conf = main_conf(&app, "wlan0", Band::Low, 6, true, false, &[vap]);
        assert!(conf.contains("interface=wlan0"));
        assert!(conf.contains("hw_mode=g"));
        assert!(conf.contains("channel=6"));
        assert!(conf.contains("ieee80211n=1"));
        assert!(!conf.contains("ieee80211ac"));
        assert!(conf.contains("ssid=hearth"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK"));
        assert!(conf.contains("vlan_file=/tmp/hostapd.wlan0.vap0.vlan"));
        assert!(conf.contains("wpa_psk_file=/tmp/hostapd.wlan0.vap0.macs"));
    }

    #[test]
    fn vlan_file_lists_reachable_rings() {
        let app = appliance();
        let vap = app.vap("vap0").unwrap();
        let out = vlan_file(&app, "wlan0", vap);
        assert_eq!(out, "1 vlan1.wlan0\n2 vlan2.wlan0\n");
    }

    #[test]
    fn macs_file_pins_clients_to_their_ring_vlan() {
        let app = appliance();
        let vap = app.vap("vap0").unwrap();
        let registry = Registry::new();
        let mut a = Client::new(MacAddr::new(0xaa, 0, 0, 0, 0, 1));
        a.ring = Some(Ring::Standard);
        registry.insert(a);
        // no ring yet: lands on the default ring's vlan
        registry.insert(Client::new(MacAddr::new(0xaa, 0, 0, 0, 0, 2)));

        let out = macs_file(&app, &registry, vap);
        assert!(out.contains("vlanid=2 aa:00:00:00:00:01 correcthorse"));
        assert!(out.contains("vlanid=1 aa:00:00:00:00:02 correcthorse"));
    }

    #[test]
    fn nt_hash_matches_known_vector() {
        // well-known MD4(UTF-16LE("password")) test vector
        assert_eq!(nt_hash("password"), "8846f7eaee8fb117ad06bdd830b7586c");
    }

    #[test]
    fn eap_users_format() {
        let users = vec![("alice".to_owned(), "password".to_owned())];
        let out = eap_users(&users);
        assert_eq!(
            out,
            "\"alice\"\tMSCHAPV2\thash:8846f7eaee8fb117ad06bdd830b7586c\t[2]\n"
        );
    }
}
