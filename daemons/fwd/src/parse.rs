//! Rule file parsing: pest grammar over one rule per line.
//!
//! The pest derive generates a module-level `Rule` enum from the grammar, so
//! this module refers to our own rule struct through the `rules::` path.
use pest::Parser;
use pest_derive::Parser;

use crate::{
    rules::{self, Action, Endpoint, EndpointKind, Proto, TimeWindow},
    FwError,
};

#[derive(Parser)]
#[grammar = "rules.pest"]
struct RuleParser;

/// Parse one rule line.
pub fn parse_rule(text: &str, file: &str, line_no: usize) -> Result<rules::Rule, FwError> {
    let mut pairs = RuleParser::parse(Rule::rule, text).map_err(|err| FwError::Parse {
        file: file.to_owned(),
        line: line_no,
        reason: err.to_string(),
    })?;
    let rule_pair = pairs.next().expect("grammar yields one rule");

    let mut action = Action::Accept;
    let mut proto = None;
    let mut from = None;
    let mut to = None;
    let mut sports = Vec::new();
    let mut dports = Vec::new();
    let mut window = None;

    for pair in rule_pair.into_inner() {
        match pair.as_rule() {
            Rule::action => {
                action = match pair.as_str() {
                    "accept" => Action::Accept,
                    "block" => Action::Block,
                    _ => Action::Capture,
                }
            }
            Rule::proto => {
                proto = Some(match pair.as_str() {
                    "tcp" => Proto::Tcp,
                    "udp" => Proto::Udp,
                    "icmp" => Proto::Icmp,
                    _ => Proto::Ip,
                })
            }
            Rule::from_clause => from = Some(parse_endpoint(pair)),
            Rule::to_clause => to = Some(parse_endpoint(pair)),
            Rule::sports_clause => sports = parse_ports(pair),
            Rule::dports_clause => dports = parse_ports(pair),
            Rule::time_clause => {
                let mut clocks = pair.into_inner();
                let start = clocks.next().expect("grammar requires start").as_str();
                let stop = clocks.next().expect("grammar requires stop").as_str();
                window = Some(TimeWindow {
                    start: start.to_owned(),
                    stop: stop.to_owned(),
                });
            }
            Rule::EOI => {}
            other => unreachable!("unexpected rule component {other:?}"),
        }
    }

    Ok(rules::Rule {
        action,
        proto,
        from,
        to,
        sports,
        dports,
        window,
        text: text.trim().to_owned(),
    })
}

fn parse_endpoint(clause: pest::iterators::Pair<'_, Rule>) -> Endpoint {
    let ep = clause
        .into_inner()
        .next()
        .expect("clause wraps an endpoint");
    let mut negated = false;
    let mut kind = EndpointKind::Addr;
    let mut detail = String::new();
    for pair in ep.into_inner() {
        match pair.as_rule() {
            Rule::negation => negated = true,
            Rule::addr_ep | Rule::ring_ep | Rule::type_ep | Rule::iface_ep => {
                kind = match pair.as_rule() {
                    Rule::addr_ep => EndpointKind::Addr,
                    Rule::ring_ep => EndpointKind::Ring,
                    Rule::type_ep => EndpointKind::Type,
                    _ => EndpointKind::Iface,
                };
                detail = pair
                    .into_inner()
                    .next()
                    .expect("endpoint carries a detail")
                    .as_str()
                    .to_owned();
            }
            _ => {}
        }
    }
    Endpoint {
        kind,
        detail,
        negated,
    }
}

fn parse_ports(clause: pest::iterators::Pair<'_, Rule>) -> Vec<u16> {
    clause
        .into_inner()
        .next()
        .expect("clause wraps ports")
        .into_inner()
        .filter_map(|p| p.as_str().parse().ok())
        .collect()
}

/// Parse every `*.rules` file in a directory, in filename order. Comment
/// (`#`) and blank lines are skipped; a bad rule fails the whole load so a
/// typo cannot silently open the network.
pub fn parse_dir(dir: &std::path::Path) -> Result<Vec<rules::Rule>, FwError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "rules").unwrap_or(false))
        .collect();
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let file = path.display().to_string();
        let raw = std::fs::read_to_string(&path)?;
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            out.push(parse_rule(line, &file, idx + 1)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rule_parses() {
        let rule = parse_rule(
            "accept tcp from ring standard to iface wan dports 80,443",
            "t",
            1,
        )
        .unwrap();
        assert_eq!(rule.action, Action::Accept);
        assert_eq!(rule.proto, Some(Proto::Tcp));
        let from = rule.from.unwrap();
        assert_eq!(from.kind, EndpointKind::Ring);
        assert_eq!(from.detail, "standard");
        let to = rule.to.unwrap();
        assert_eq!(to.kind, EndpointKind::Iface);
        assert_eq!(to.detail, "wan");
        assert_eq!(rule.dports, vec![80, 443]);
    }

    #[test]
    fn negation_and_cidr() {
        let rule = parse_rule("block from not addr 10.0.0.0/8", "t", 1).unwrap();
        let from = rule.from.unwrap();
        assert!(from.negated);
        assert_eq!(from.kind, EndpointKind::Addr);
        assert_eq!(from.detail, "10.0.0.0/8");
    }

    #[test]
    fn capture_and_time_window() {
        let rule = parse_rule("capture from ring unenrolled", "t", 1).unwrap();
        assert_eq!(rule.action, Action::Capture);

        let rule =
            parse_rule("accept udp to ring core dports 53 time 08:00-18:00", "t", 1).unwrap();
        let window = rule.window.unwrap();
        assert_eq!(window.start, "08:00");
        assert_eq!(window.stop, "18:00");
    }

    #[test]
    fn garbage_is_rejected_with_location() {
        let err = parse_rule("permit everything", "site.rules", 7).unwrap_err();
        match err {
            FwError::Parse { file, line, .. } => {
                assert_eq!(file, "site.rules");
                assert_eq!(line, 7);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn directory_load_is_filename_ordered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-second.rules"), "block from ring guest\n").unwrap();
        std::fs::write(
            dir.path().join("10-first.rules"),
            "# comment\naccept tcp to iface wan dports 443\n\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not rules\n").unwrap();

        let rules = parse_dir(dir.path()).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].action, Action::Accept);
        assert_eq!(rules[1].action, Action::Block);
    }
}
