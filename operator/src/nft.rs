//! nftables ingress enforcement for the gateway device.
//!
//! The chain is default-drop; every accept rule carries a comment derived
//! from its source and destination, which doubles as the rule's identity.
//! The whole driver rides the `nft` binary: the ingress hook's device
//! binding is only expressible in ruleset syntax, and `nft -j` gives us the
//! handles needed to prune stale rules.

use ipnet::IpNet;
use serde::Deserialize;
use shared::{
    host_net,
    resources::{WireguardAccessPeer, WireguardAccessRule},
};
use std::{collections::HashMap, io, net::IpAddr, process::Command};

pub const TABLE_NAME: &str = "wga";

fn nft(args: &[&str]) -> Result<Vec<u8>, io::Error> {
    log::debug!("nft {}", args.join(" "));
    let output = Command::new("nft").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "nft {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Ensure the netdev table and the default-drop ingress chain exist.
///
/// Failures panic: without the chain the data plane is unusable, and a
/// restart re-runs this cleanly.
pub fn ensure_chain(device: &str) {
    if let Err(e) = nft(&["add", "table", "netdev", TABLE_NAME]) {
        panic!("cannot ensure nftables table {TABLE_NAME}: {e}");
    }

    let hook = format!("{{ type filter hook ingress device {device} priority 0 ; policy drop ; }}");
    if let Err(e) = nft(&["add", "chain", "netdev", TABLE_NAME, device, &hook]) {
        panic!("cannot ensure ingress chain {device}: {e}");
    }
}

/// An existing rule in the ingress chain: its kernel handle plus the
/// user-data comment identifying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRule {
    pub handle: u64,
    pub comment: String,
}

#[derive(Deserialize)]
struct Ruleset {
    #[serde(default)]
    nftables: Vec<RulesetEntry>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RulesetEntry {
    rule: Option<RuleEntry>,
}

#[derive(Deserialize)]
struct RuleEntry {
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
}

fn parse_rule_listing(raw: &[u8]) -> Result<Vec<ExistingRule>, io::Error> {
    let ruleset: Ruleset = serde_json::from_slice(raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(ruleset
        .nftables
        .into_iter()
        .filter_map(|entry| entry.rule)
        .map(|rule| ExistingRule {
            handle: rule.handle,
            comment: rule.comment.unwrap_or_default(),
        })
        .collect())
}

fn list_rules(device: &str) -> Result<Vec<ExistingRule>, io::Error> {
    let raw = nft(&["-j", "list", "chain", "netdev", TABLE_NAME, device])?;
    parse_rule_listing(&raw)
}

/// Keep only `[0-9A-Za-z]`, the alphabet used inside rule comments.
pub fn strip(s: &str) -> String {
    s.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Stable identity of a routing rule.
pub fn routing_tag(snet: &IpNet, dnet: &IpNet) -> String {
    format!("r{}", strip(&format!("{snet}{dnet}")))
}

/// Stable identity of the DNS/HTTP helper rules of one peer.
pub fn dns_tag(snet: &IpNet, dns: &IpAddr) -> String {
    format!("r{}", strip(&format!("{snet}{dns}")))
}

fn family(snet: &IpNet) -> &'static str {
    match snet {
        IpNet::V4(_) => "ip",
        IpNet::V6(_) => "ip6",
    }
}

fn add_routing_rule(device: &str, snet: &IpNet, dnet: &IpNet, tag: &str) -> Result<(), io::Error> {
    let fam = family(snet);
    nft(&[
        "add", "rule", "netdev", TABLE_NAME, device,
        fam, "saddr", &snet.to_string(),
        fam, "daddr", &dnet.to_string(),
        "counter", "accept", "comment", tag,
    ])
    .map(|_| ())
}

fn add_dns_rule(device: &str, snet: &IpNet, dns: &IpAddr, tag: &str) -> Result<(), io::Error> {
    let fam = family(snet);
    nft(&[
        "add", "rule", "netdev", TABLE_NAME, device,
        fam, "saddr", &snet.to_string(),
        fam, "daddr", &dns.to_string(),
        "udp", "dport", "53",
        "counter", "accept", "comment", tag,
    ])
    .map(|_| ())
}

fn add_http_rule(device: &str, snet: &IpNet, dns: &IpAddr, tag: &str) -> Result<(), io::Error> {
    let fam = family(snet);
    nft(&[
        "add", "rule", "netdev", TABLE_NAME, device,
        fam, "saddr", &snet.to_string(),
        fam, "daddr", &dns.to_string(),
        "tcp", "dport", "{ 80, 443 }",
        "counter", "accept", "comment", tag,
    ])
    .map(|_| ())
}

fn delete_rule(device: &str, handle: u64) -> Result<(), io::Error> {
    nft(&[
        "delete", "rule", "netdev", TABLE_NAME, device,
        "handle", &handle.to_string(),
    ])
    .map(|_| ())
}

/// Remove every existing rule whose comment contains `tag`; true if any did.
///
/// Substring matching is deliberate: the DNS/HTTP rules of a peer share the
/// routing tags' prefix construction, so one kept tag keeps its derived
/// rules alive too.
fn claim(have: &mut Vec<ExistingRule>, tag: &str) -> bool {
    let before = have.len();
    have.retain(|rule| !rule.comment.contains(tag));
    before != have.len()
}

fn destinations_by_rule(rules: &[WireguardAccessRule]) -> HashMap<String, Vec<IpNet>> {
    let mut map = HashMap::new();
    for rule in rules {
        let name = rule.metadata.name.clone().unwrap_or_default();
        let mut nets = vec![];
        for destination in &rule.spec.destinations {
            match destination.parse::<IpNet>() {
                Ok(net) => nets.push(net.trunc()),
                Err(_) => {
                    log::error!("rule {} has unparseable destination {:?}", name, destination)
                },
            }
        }
        map.insert(name, nets);
    }
    map
}

/// Rebuild the ingress chain from the desired peer and rule set.
///
/// Existing rules whose tag is re-derived survive untouched; missing ones
/// are added; whatever is left in `have` afterwards is stale and deleted by
/// handle. Individual rule failures are logged and skipped so one bad entry
/// never blocks the rest.
pub fn sync_rules(peers: &[WireguardAccessPeer], rules: &[WireguardAccessRule], device: &str) {
    ensure_chain(device);

    let mut have = match list_rules(device) {
        Ok(have) => have,
        Err(e) => panic!("cannot list ingress rules on {device}: {e}"),
    };

    let destinations = destinations_by_rule(rules);

    for peer in peers {
        let name = peer.metadata.name.as_deref().unwrap_or("<unnamed>");
        let status = match &peer.status {
            // will be reconciled once the address lands
            Some(status) if !status.address.is_empty() => status,
            _ => continue,
        };
        let address: IpAddr = match status.address.parse() {
            Ok(address) => address,
            Err(_) => {
                log::error!("peer {} has unparseable address {:?}", name, status.address);
                continue;
            },
        };
        let snet = host_net(address);

        for rule_name in &peer.spec.access_rules {
            let nets = destinations.get(rule_name).map(Vec::as_slice).unwrap_or_default();
            for dnet in nets {
                let tag = routing_tag(&snet, dnet);
                if claim(&mut have, &tag) {
                    continue;
                }
                if let Err(e) = add_routing_rule(device, &snet, dnet, &tag) {
                    log::error!("cannot add rule for peer {} destination {}: {}", name, dnet, e);
                }
            }
        }

        if let Some(first) = status.dns.first() {
            let dns: IpAddr = match first.parse() {
                Ok(dns) => dns,
                Err(_) => {
                    log::error!("peer {} has unparseable dns server {:?}", name, first);
                    continue;
                },
            };
            let tag = dns_tag(&snet, &dns);
            if !claim(&mut have, &tag) {
                if let Err(e) = add_dns_rule(device, &snet, &dns, &tag) {
                    log::error!("cannot add dns rule for peer {}: {}", name, e);
                }
                if let Err(e) = add_http_rule(device, &snet, &dns, &tag) {
                    log::error!("cannot add http rule for peer {}: {}", name, e);
                }
            }
        }
    }

    for stale in have {
        log::info!("deleting stale rule {} ({:?})", stale.handle, stale.comment);
        if let Err(e) = delete_rule(device, stale.handle) {
            log::warn!("error deleting stale rule {}: {}", stale.handle, e);
        }
    }
}

/// Tunneled traffic only leaves the box with forwarding on.
pub fn ensure_forwarding() {
    for knob in [
        "net.ipv6.conf.all.forwarding=1",
        "net.ipv4.ip_forward=1",
    ] {
        match Command::new("sysctl").args(["-w", knob]).output() {
            Ok(output) if output.status.success() => {},
            Ok(output) => log::error!(
                "sysctl -w {} failed: {}",
                knob,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => log::error!("failed to run sysctl: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_keeps_alnum_only() {
        assert_eq!(strip("fd00::5/1282001:db8::/64"), "fd0051282001db864");
        assert_eq!(strip("10.0.0.1/32"), "100132");
        assert_eq!(strip(""), "");
    }

    #[test]
    fn test_routing_tag() {
        let snet: IpNet = "fd00::5/128".parse().unwrap();
        let dnet: IpNet = "2001:db8::/64".parse().unwrap();
        assert_eq!(routing_tag(&snet, &dnet), "rfd0051282001db864");
    }

    #[test]
    fn test_dns_tag_shares_source_prefix() {
        let snet: IpNet = "fd00::5/128".parse().unwrap();
        let dns: IpAddr = "2606:4700:4700::1111".parse().unwrap();
        let tag = dns_tag(&snet, &dns);
        assert!(tag.starts_with(&format!("r{}", strip(&snet.to_string()))));
    }

    #[test]
    fn test_claim_removes_all_matches() {
        let mut have = vec![
            ExistingRule { handle: 1, comment: "rfd005128dns".into() },
            ExistingRule { handle: 2, comment: "rfd005128".into() },
            ExistingRule { handle: 3, comment: "other".into() },
        ];
        assert!(claim(&mut have, "rfd005128"));
        assert_eq!(have.len(), 1);
        assert_eq!(have[0].handle, 3);
        assert!(!claim(&mut have, "rfd005128"));
    }

    #[test]
    fn test_parse_rule_listing() {
        let raw = br#"{
            "nftables": [
                {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak #3", "json_schema_version": 1}},
                {"chain": {"family": "netdev", "table": "wga", "name": "wga", "handle": 1, "type": "filter", "hook": "ingress", "dev": "wga", "prio": 0, "policy": "drop"}},
                {"rule": {"family": "netdev", "table": "wga", "chain": "wga", "handle": 4, "comment": "rfd0051282001db864", "expr": [{"counter": {"packets": 0, "bytes": 0}}, {"accept": null}]}},
                {"rule": {"family": "netdev", "table": "wga", "chain": "wga", "handle": 5, "expr": []}}
            ]
        }"#;
        let rules = parse_rule_listing(raw).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], ExistingRule { handle: 4, comment: "rfd0051282001db864".into() });
        assert_eq!(rules[1].comment, "");
    }

    #[test]
    fn test_parse_rule_listing_rejects_garbage() {
        assert!(parse_rule_listing(b"nope").is_err());
    }

    #[test]
    fn test_destinations_by_rule_skips_invalid() {
        let rule = WireguardAccessRule::new(
            "office",
            shared::resources::WireguardAccessRuleSpec {
                destinations: vec!["2001:db8::/64".into(), "bogus".into()],
            },
        );
        let map = destinations_by_rule(&[rule]);
        assert_eq!(map["office"].len(), 1);
    }
}
