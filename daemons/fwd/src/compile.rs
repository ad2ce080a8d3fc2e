//! Ruleset generation: sorted rules plus ring topology in, one
//! `iptables-restore` document out. Output is a pure function of its inputs
//! so identical inputs give bit-identical files.
use std::{collections::BTreeMap, net::Ipv4Addr, sync::Arc};

use rings::{Appliance, Ring};

use crate::{
    rules::{sort_rules, Action, Endpoint, EndpointKind, Proto, Rule},
    FwError,
};

/// device-type name -> member addresses, resolved from the tree at compile
/// time; rules naming an absent type compile to a comment
pub type TypeMembers = BTreeMap<String, Vec<Ipv4Addr>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Src,
    Dst,
}

/// The ruleset compiler.
#[derive(Debug)]
pub struct Compiler {
    appliance: Arc<Appliance>,
    type_members: TypeMembers,
    /// keep WAN noise out of the rate-limited drop log
    exclude_wan_log: bool,
}

impl Compiler {
    /// compiler over the appliance topology
    pub fn new(appliance: Arc<Appliance>) -> Self {
        Self {
            appliance,
            type_members: TypeMembers::new(),
            exclude_wan_log: false,
        }
    }

    /// supply device-type membership for `type` endpoints
    pub fn with_type_members(mut self, members: TypeMembers) -> Self {
        self.type_members = members;
        self
    }

    /// drop WAN packets without logging them
    pub fn exclude_wan_log(mut self, exclude: bool) -> Self {
        self.exclude_wan_log = exclude;
        self
    }

    /// Compile rules into an `iptables-restore` document.
    pub fn compile(&self, rules: &[Rule]) -> Result<String, FwError> {
        let mut rules = self.expand_types(rules);
        sort_rules(&mut rules);

        let wan = &self.appliance.network.wan_iface;
        let mut nat = Vec::new();
        let mut filter = Vec::new();

        // conntrack fast path
        filter.push("-A INPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_owned());
        filter.push("-A FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT".to_owned());

        // NAT and forward-new for every ring that routes to the uplink
        for cfg in self.appliance.rings().filter(|c| c.ring.routes_to_wan()) {
            nat.push(format!(
                "-A POSTROUTING -s {} -o {} -j MASQUERADE",
                cfg.subnet, wan
            ));
            filter.push(format!(
                "-A FORWARD -s {} -o {} -m conntrack --ctstate NEW -j ACCEPT",
                cfg.subnet, wan
            ));
        }

        for rule in &rules {
            match rule.action {
                Action::Capture => {
                    let (mut n, mut f) = self.capture_group(rule)?;
                    nat.append(&mut n);
                    filter.append(&mut f);
                }
                Action::Accept | Action::Block => {
                    filter.append(&mut self.plain_rule(rule)?);
                }
            }
        }

        let mut out = String::from("# hearth firewall ruleset\n");
        out.push_str("*nat\n");
        out.push_str(":PREROUTING ACCEPT [0:0]\n");
        out.push_str(":INPUT ACCEPT [0:0]\n");
        out.push_str(":OUTPUT ACCEPT [0:0]\n");
        out.push_str(":POSTROUTING ACCEPT [0:0]\n");
        for line in &nat {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out.push_str("*filter\n");
        out.push_str(":INPUT ACCEPT [0:0]\n");
        out.push_str(":FORWARD ACCEPT [0:0]\n");
        out.push_str(":OUTPUT ACCEPT [0:0]\n");
        out.push_str(":dropped - [0:0]\n");
        if self.exclude_wan_log {
            out.push_str(&format!("-A dropped -i {wan} -j DROP\n"));
        }
        out.push_str("-A dropped -m limit --limit 10/min -j LOG --log-prefix \"DROPPED \"\n");
        out.push_str("-A dropped -j DROP\n");
        for line in &filter {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }

    /// Expand `type` endpoints into one address rule per member.
    fn expand_types(&self, rules: &[Rule]) -> Vec<Rule> {
        let mut out = Vec::with_capacity(rules.len());
        for rule in rules {
            let from_type = rule.from.as_ref().filter(|e| e.kind == EndpointKind::Type);
            let to_type = rule.to.as_ref().filter(|e| e.kind == EndpointKind::Type);
            match (from_type, to_type) {
                (None, None) => out.push(rule.clone()),
                (Some(ep), None) => {
                    for ip in self.members(&ep.detail) {
                        let mut r = rule.clone();
                        r.from = Some(addr_ep(ip, ep.negated));
                        out.push(r);
                    }
                }
                (None, Some(ep)) => {
                    for ip in self.members(&ep.detail) {
                        let mut r = rule.clone();
                        r.to = Some(addr_ep(ip, ep.negated));
                        out.push(r);
                    }
                }
                (Some(fep), Some(tep)) => {
                    for fip in self.members(&fep.detail) {
                        for tip in self.members(&tep.detail) {
                            let mut r = rule.clone();
                            r.from = Some(addr_ep(fip, fep.negated));
                            r.to = Some(addr_ep(tip, tep.negated));
                            out.push(r);
                        }
                    }
                }
            }
        }
        out
    }

    fn members(&self, type_name: &str) -> Vec<Ipv4Addr> {
        let mut ips = self
            .type_members
            .get(type_name)
            .cloned()
            .unwrap_or_default();
        ips.sort();
        ips
    }

    /// accept/block rule into FORWARD
    fn plain_rule(&self, rule: &Rule) -> Result<Vec<String>, FwError> {
        let mut args: Vec<String> = vec!["-A".into(), "FORWARD".into()];
        if let Some(ep) = &rule.from {
            args.extend(self.endpoint_args(ep, Dir::Src)?);
        }
        if let Some(ep) = &rule.to {
            args.extend(self.endpoint_args(ep, Dir::Dst)?);
        }
        let proto = rule.proto.unwrap_or(Proto::Ip);
        if proto != Proto::Ip {
            args.push("-p".into());
            args.push(proto.as_str().into());
        }
        push_ports(&mut args, "--sport", "--sports", &rule.sports);
        push_ports(&mut args, "--dport", "--dports", &rule.dports);
        if let Some(window) = &rule.window {
            args.push("-m".into());
            args.push("time".into());
            args.push("--timestart".into());
            args.push(window.start.clone());
            args.push("--timestop".into());
            args.push(window.stop.clone());
        }
        args.push("-j".into());
        args.push(match rule.action {
            Action::Accept => "ACCEPT".into(),
            _ => "dropped".into(),
        });
        Ok(vec![args.join(" ")])
    }

    /// The captive-portal group for one captured source: DNAT web traffic to
    /// the ring router, allow DNS/DHCP/HTTP, drop the rest from that
    /// interface.
    fn capture_group(&self, rule: &Rule) -> Result<(Vec<String>, Vec<String>), FwError> {
        let ep = rule
            .from
            .as_ref()
            .ok_or_else(|| FwError::UnknownRing("capture needs a from endpoint".into()))?;
        let (iface, router) = self.capture_target(ep)?;

        let nat = vec![format!(
            "-A PREROUTING -i {iface} -p tcp --dport 80 -j DNAT --to-destination {router}"
        )];
        let mut filter = Vec::new();
        for chain in ["INPUT", "FORWARD"] {
            filter.push(format!("-A {chain} -i {iface} -p udp --dport 53 -j ACCEPT"));
            filter.push(format!("-A {chain} -i {iface} -p udp --dport 67 -j ACCEPT"));
            filter.push(format!("-A {chain} -i {iface} -p tcp --dport 80 -j ACCEPT"));
        }
        for chain in ["INPUT", "FORWARD"] {
            filter.push(format!("-A {chain} -i {iface} -j dropped"));
        }
        Ok((nat, filter))
    }

    fn capture_target(&self, ep: &Endpoint) -> Result<(String, Ipv4Addr), FwError> {
        match ep.kind {
            EndpointKind::Ring => {
                let ring: Ring = ep
                    .detail
                    .parse()
                    .map_err(|_| FwError::UnknownRing(ep.detail.clone()))?;
                let cfg = self
                    .appliance
                    .ring(ring)
                    .ok_or_else(|| FwError::UnknownRing(ep.detail.clone()))?;
                Ok((cfg.bridge(), cfg.router()))
            }
            EndpointKind::Iface => {
                // map a bridge name back to its ring for the router address
                let vlan = ep
                    .detail
                    .strip_prefix("brvlan")
                    .and_then(|v| v.parse::<u16>().ok());
                let cfg = vlan
                    .and_then(|v| self.appliance.ring_for_vlan(v))
                    .ok_or_else(|| FwError::UnknownRing(ep.detail.clone()))?;
                Ok((ep.detail.clone(), cfg.router()))
            }
            _ => Err(FwError::UnknownRing(format!(
                "capture from {:?} endpoint",
                ep.kind
            ))),
        }
    }

    fn endpoint_args(&self, ep: &Endpoint, dir: Dir) -> Result<Vec<String>, FwError> {
        let mut args = Vec::new();
        if ep.negated {
            args.push("!".to_owned());
        }
        match ep.kind {
            EndpointKind::Addr => {
                args.push(match dir {
                    Dir::Src => "-s".into(),
                    Dir::Dst => "-d".into(),
                });
                args.push(ep.detail.clone());
            }
            EndpointKind::Ring => {
                let ring: Ring = ep
                    .detail
                    .parse()
                    .map_err(|_| FwError::UnknownRing(ep.detail.clone()))?;
                let cfg = self
                    .appliance
                    .ring(ring)
                    .ok_or_else(|| FwError::UnknownRing(ep.detail.clone()))?;
                args.push(match dir {
                    Dir::Src => "-i".into(),
                    Dir::Dst => "-o".into(),
                });
                args.push(cfg.bridge());
            }
            EndpointKind::Iface => {
                let iface = if ep.detail == "wan" {
                    self.appliance.network.wan_iface.clone()
                } else {
                    ep.detail.clone()
                };
                args.push(match dir {
                    Dir::Src => "-i".into(),
                    Dir::Dst => "-o".into(),
                });
                args.push(iface);
            }
            // expanded before emission
            EndpointKind::Type => unreachable!("type endpoints are expanded before emission"),
        }
        Ok(args)
    }
}

fn addr_ep(ip: Ipv4Addr, negated: bool) -> Endpoint {
    Endpoint {
        kind: EndpointKind::Addr,
        detail: format!("{ip}/32"),
        negated,
    }
}

fn push_ports(args: &mut Vec<String>, single: &str, multi: &str, ports: &[u16]) {
    match ports.len() {
        0 => {}
        1 => {
            args.push(single.to_owned());
            args.push(ports[0].to_string());
        }
        _ => {
            args.push("-m".to_owned());
            args.push("multiport".to_owned());
            args.push(multi.to_owned());
            args.push(
                ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_rule;

    const SAMPLE: &str = r#"
network:
  domainname: example.net
  dnsserver: "8.8.8.8:53"
  wan_iface: wan0
rings:
  unenrolled:
    subnet: "192.168.1.0/24"
    vlan: 1
  standard:
    subnet: "192.168.2.0/24"
    vlan: 2
  setup:
    subnet: "192.168.8.0/24"
    vlan: 8
  quarantine:
    subnet: "192.168.9.0/24"
    vlan: 9
"#;

    fn compiler() -> Compiler {
        Compiler::new(Arc::new(Appliance::parse_str(SAMPLE).unwrap()))
    }

    fn rules(lines: &[&str]) -> Vec<Rule> {
        lines
            .iter()
            .enumerate()
            .map(|(i, l)| parse_rule(l, "test", i + 1).unwrap())
            .collect()
    }

    #[test]
    fn compiling_twice_is_bit_identical() {
        let c = compiler();
        let rs = rules(&[
            "accept tcp from ring standard to iface wan dports 80,443",
            "block from ring quarantine",
            "capture from ring unenrolled",
        ]);
        let a = c.compile(&rs).unwrap();
        let b = c.compile(&rs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn masquerade_skips_setup_and_quarantine() {
        let out = compiler().compile(&[]).unwrap();
        assert!(out.contains("-A POSTROUTING -s 192.168.1.0/24 -o wan0 -j MASQUERADE"));
        assert!(out.contains("-A POSTROUTING -s 192.168.2.0/24 -o wan0 -j MASQUERADE"));
        assert!(!out.contains("192.168.8.0/24 -o wan0 -j MASQUERADE"));
        assert!(!out.contains("192.168.9.0/24 -o wan0 -j MASQUERADE"));
        // conntrack fast path and the dropped chain are always present
        assert!(out.contains("--ctstate RELATED,ESTABLISHED -j ACCEPT"));
        assert!(out.contains(":dropped - [0:0]"));
        assert!(out.contains("-A dropped -m limit --limit 10/min -j LOG"));
    }

    #[test]
    fn capture_expands_to_the_portal_group() {
        let out = compiler()
            .compile(&rules(&["capture from ring unenrolled"]))
            .unwrap();
        assert!(out.contains(
            "-A PREROUTING -i brvlan1 -p tcp --dport 80 -j DNAT --to-destination 192.168.1.1"
        ));
        assert!(out.contains("-A INPUT -i brvlan1 -p udp --dport 53 -j ACCEPT"));
        assert!(out.contains("-A FORWARD -i brvlan1 -p udp --dport 67 -j ACCEPT"));
        assert!(out.contains("-A INPUT -i brvlan1 -j dropped"));
    }

    #[test]
    fn block_rules_route_to_the_dropped_chain() {
        let out = compiler()
            .compile(&rules(&["block udp from ring standard dports 25"]))
            .unwrap();
        assert!(out.contains("-A FORWARD -i brvlan2 -p udp --dport 25 -j dropped"));
    }

    #[test]
    fn negated_endpoints_emit_bang() {
        let out = compiler()
            .compile(&rules(&["block from not addr 192.168.0.0/16"]))
            .unwrap();
        assert!(out.contains("-A FORWARD ! -s 192.168.0.0/16 -j dropped"));
    }

    #[test]
    fn type_endpoints_expand_per_member() {
        let mut members = TypeMembers::new();
        members.insert(
            "camera".into(),
            vec![
                Ipv4Addr::new(192, 168, 2, 40),
                Ipv4Addr::new(192, 168, 2, 41),
            ],
        );
        let out = Compiler::new(Arc::new(Appliance::parse_str(SAMPLE).unwrap()))
            .with_type_members(members)
            .compile(&rules(&["block from type camera to iface wan"]))
            .unwrap();
        assert!(out.contains("-A FORWARD -s 192.168.2.40/32 -o wan0 -j dropped"));
        assert!(out.contains("-A FORWARD -s 192.168.2.41/32 -o wan0 -j dropped"));
        // unknown type compiles to nothing rather than an open rule
        let none = compiler()
            .compile(&rules(&["block from type unknown to iface wan"]))
            .unwrap();
        assert!(!none.contains("type"));
    }

    #[test]
    fn wan_exclusion_precedes_the_drop_log() {
        let out = compiler()
            .exclude_wan_log(true)
            .compile(&[])
            .unwrap();
        let excl = out.find("-A dropped -i wan0 -j DROP").unwrap();
        let log = out.find("-A dropped -m limit").unwrap();
        assert!(excl < log);
    }
}
