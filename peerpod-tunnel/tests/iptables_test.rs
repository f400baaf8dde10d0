//! iptables rule programming inside a throwaway namespace.
//!
//! Requires root and the `iptables` binary - run with:
//!   sudo -E cargo test --package peerpod-tunnel --test iptables_test --features test-util

use peerpod_netops::test_util::{TestNamespace, is_root};
use peerpod_tunnel::iptables::{self, CHAIN_NAME};
use std::process::Command;

fn has_iptables() -> bool {
    Command::new("iptables").arg("--version").output().is_ok()
}

/// iptables-nft lists `NOTRACK` as `CT --notrack`.
fn is_notrack(rule: &str) -> bool {
    rule.contains("-j NOTRACK") || rule.contains("--notrack")
}

fn skip() -> bool {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return true;
    }
    if !has_iptables() {
        eprintln!("Skipping test: iptables not installed");
        return true;
    }
    false
}

/// Applying the rules creates the chains, the per-interface rules and the
/// jumps from the builtin chains.
#[tokio::test]
async fn test_apply_rules() {
    if skip() {
        return;
    }

    let ns = TestNamespace::create("ppipt-apply").unwrap();
    let rules = iptables::peerpod_rules(&["ppvrf1", "ppvrf2", "eth1"]);
    iptables::apply_rules(&ns, &rules).unwrap();

    let raw = iptables::list_rules(&ns, "raw", CHAIN_NAME).unwrap();
    for iface in ["ppvrf1", "ppvrf2", "eth1"] {
        assert!(
            raw.iter().any(|rule| rule.contains(&format!("-i {iface}")) && is_notrack(rule)),
            "missing raw rule for {iface}: {raw:?}"
        );
    }

    let filter = iptables::list_rules(&ns, "filter", CHAIN_NAME).unwrap();
    assert_eq!(
        filter.iter().filter(|rule| rule.contains("-j ACCEPT")).count(),
        3
    );
    assert!(filter.iter().all(|rule| !rule.starts_with("-A") || rule.contains("peerpod")));

    let prerouting = iptables::list_rules(&ns, "raw", "PREROUTING").unwrap();
    assert!(prerouting.iter().any(|rule| rule == "-A PREROUTING -j PEERPOD"));

    let forward = iptables::list_rules(&ns, "filter", "FORWARD").unwrap();
    assert!(forward.iter().any(|rule| rule == "-A FORWARD -j PEERPOD"));
}

/// A second application leaves the tables unchanged.
#[tokio::test]
async fn test_apply_rules_is_idempotent() {
    if skip() {
        return;
    }

    let ns = TestNamespace::create("ppipt-idem").unwrap();
    let rules = iptables::peerpod_rules(&["ppvrf1", "ppvrf2", "eth1"]);

    iptables::apply_rules(&ns, &rules).unwrap();
    let first: Vec<Vec<String>> = [
        ("raw", CHAIN_NAME),
        ("raw", "PREROUTING"),
        ("filter", CHAIN_NAME),
        ("filter", "FORWARD"),
    ]
    .iter()
    .map(|(table, chain)| iptables::list_rules(&ns, table, chain).unwrap())
    .collect();

    iptables::apply_rules(&ns, &rules).unwrap();
    let second: Vec<Vec<String>> = [
        ("raw", CHAIN_NAME),
        ("raw", "PREROUTING"),
        ("filter", CHAIN_NAME),
        ("filter", "FORWARD"),
    ]
    .iter()
    .map(|(table, chain)| iptables::list_rules(&ns, table, chain).unwrap())
    .collect();

    assert_eq!(first, second);
}

/// Rules for another interface are appended next to the existing ones.
#[tokio::test]
async fn test_apply_rules_for_second_host_interface() {
    if skip() {
        return;
    }

    let ns = TestNamespace::create("ppipt-second").unwrap();
    iptables::apply_rules(&ns, &iptables::peerpod_rules(&["ppvrf1", "ppvrf2", "eth1"])).unwrap();
    iptables::apply_rules(&ns, &iptables::peerpod_rules(&["ppvrf1", "ppvrf2", "eth2"])).unwrap();

    let filter = iptables::list_rules(&ns, "filter", CHAIN_NAME).unwrap();
    assert_eq!(
        filter.iter().filter(|rule| rule.contains("-j ACCEPT")).count(),
        4
    );
    let forward = iptables::list_rules(&ns, "filter", "FORWARD").unwrap();
    assert_eq!(
        forward.iter().filter(|rule| rule.contains("-j PEERPOD")).count(),
        1
    );
}
