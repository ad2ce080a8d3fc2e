//! Rule structures and the specificity ordering.
use std::cmp::Ordering;

use rings::Ring;

/// What a rule does with matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    /// let it through
    Accept,
    /// captive-portal group: DNAT web, allow bootstrap protocols, drop rest
    Capture,
    /// log (rate-limited) and drop
    Block,
}

/// Protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// tcp
    Tcp,
    /// udp
    Udp,
    /// icmp
    Icmp,
    /// any ip
    Ip,
}

impl Proto {
    /// iptables `-p` argument
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Icmp => "icmp",
            Proto::Ip => "ip",
        }
    }
}

/// Endpoint kinds in increasing breadth; the sort prefers narrower kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndpointKind {
    /// a literal address or CIDR block
    Addr,
    /// a device type (resolved to member addresses at compile time)
    Type,
    /// a ring (resolved to its bridge interface)
    Ring,
    /// a literal interface name (`wan` resolves to the uplink)
    Iface,
}

/// One endpoint of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// what kind of endpoint
    pub kind: EndpointKind,
    /// the detail: CIDR text, type name, ring name, or interface name
    pub detail: String,
    /// invert the match
    pub negated: bool,
}

impl Endpoint {
    /// the ring this endpoint names, when it is a ring endpoint
    pub fn ring(&self) -> Option<Ring> {
        (self.kind == EndpointKind::Ring)
            .then(|| self.detail.parse().ok())
            .flatten()
    }
}

/// Daily activation window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    /// HH:MM
    pub start: String,
    /// HH:MM
    pub stop: String,
}

/// One parsed rule, plus its source text for stable tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// action
    pub action: Action,
    /// protocol, when constrained
    pub proto: Option<Proto>,
    /// source endpoint, when constrained
    pub from: Option<Endpoint>,
    /// destination endpoint, when constrained
    pub to: Option<Endpoint>,
    /// source ports
    pub sports: Vec<u16>,
    /// destination ports
    pub dports: Vec<u16>,
    /// activation window
    pub window: Option<TimeWindow>,
    /// the original rule text
    pub text: String,
}

/// endpoint specificity: concrete kinds in declared order, unconstrained last
fn kind_rank(ep: &Option<Endpoint>) -> u8 {
    match ep {
        Some(ep) => match ep.kind {
            EndpointKind::Addr => 0,
            EndpointKind::Type => 1,
            EndpointKind::Ring => 2,
            EndpointKind::Iface => 3,
        },
        None => 4,
    }
}

impl Rule {
    /// The specificity comparator: accept before block, narrower source
    /// kind first, narrower destination kind first, more destination ports
    /// first, more source ports first. Remaining ties order by the rule's
    /// source text so the result is a stable total order.
    pub fn specificity(&self, other: &Rule) -> Ordering {
        self.action
            .cmp(&other.action)
            .then_with(|| kind_rank(&self.from).cmp(&kind_rank(&other.from)))
            .then_with(|| kind_rank(&self.to).cmp(&kind_rank(&other.to)))
            .then_with(|| other.dports.len().cmp(&self.dports.len()))
            .then_with(|| other.sports.len().cmp(&self.sports.len()))
            .then_with(|| self.text.cmp(&other.text))
    }
}

/// Sort rules most-specific-first.
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| a.specificity(b));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(action: Action, from: Option<EndpointKind>, to: Option<EndpointKind>, dports: usize, sports: usize, text: &str) -> Rule {
        let ep = |kind: EndpointKind| Endpoint {
            kind,
            detail: "x".into(),
            negated: false,
        };
        Rule {
            action,
            proto: Some(Proto::Tcp),
            from: from.map(ep),
            to: to.map(ep),
            sports: (0..sports as u16).collect(),
            dports: (0..dports as u16).collect(),
            window: None,
            text: text.into(),
        }
    }

    #[test]
    fn accept_sorts_before_block() {
        let mut rules = vec![
            rule(Action::Block, Some(EndpointKind::Addr), None, 0, 0, "b"),
            rule(Action::Accept, None, None, 0, 0, "a"),
        ];
        sort_rules(&mut rules);
        assert_eq!(rules[0].action, Action::Accept);
    }

    #[test]
    fn narrower_source_kind_sorts_first() {
        let mut rules = vec![
            rule(Action::Accept, Some(EndpointKind::Iface), None, 0, 0, "iface"),
            rule(Action::Accept, None, None, 0, 0, "none"),
            rule(Action::Accept, Some(EndpointKind::Ring), None, 0, 0, "ring"),
            rule(Action::Accept, Some(EndpointKind::Addr), None, 0, 0, "addr"),
            rule(Action::Accept, Some(EndpointKind::Type), None, 0, 0, "type"),
        ];
        sort_rules(&mut rules);
        let order: Vec<&str> = rules.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(order, vec!["addr", "type", "ring", "iface", "none"]);
    }

    #[test]
    fn more_dports_sort_first_then_sports() {
        let mut rules = vec![
            rule(Action::Accept, Some(EndpointKind::Ring), None, 1, 0, "one-dport"),
            rule(Action::Accept, Some(EndpointKind::Ring), None, 3, 0, "three-dports"),
            rule(Action::Accept, Some(EndpointKind::Ring), None, 1, 2, "one-dport-two-sports"),
        ];
        sort_rules(&mut rules);
        let order: Vec<&str> = rules.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            order,
            vec!["three-dports", "one-dport-two-sports", "one-dport"]
        );
    }

    #[test]
    fn the_comparator_is_a_total_order() {
        // antisymmetry and transitivity spot-check over a small set
        let rules = vec![
            rule(Action::Accept, Some(EndpointKind::Addr), None, 2, 0, "a"),
            rule(Action::Accept, Some(EndpointKind::Addr), None, 2, 0, "b"),
            rule(Action::Block, None, Some(EndpointKind::Ring), 0, 1, "c"),
            rule(Action::Capture, Some(EndpointKind::Ring), None, 0, 0, "d"),
        ];
        for a in &rules {
            assert_eq!(a.specificity(a), Ordering::Equal);
            for b in &rules {
                match a.specificity(b) {
                    Ordering::Less => assert_eq!(b.specificity(a), Ordering::Greater),
                    Ordering::Greater => assert_eq!(b.specificity(a), Ordering::Less),
                    Ordering::Equal => assert_eq!(b.specificity(a), Ordering::Equal),
                }
            }
        }
    }
}
