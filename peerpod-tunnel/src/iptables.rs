//! Packet filter rules that let tunnel traffic bypass conntrack and the
//! forward policy, driven through the `iptables` binary.
//!
//! Commands are run from a thread inside the target namespace so the rules
//! land in that namespace's tables.

use peerpod_netops::Ns;
use std::io;
use std::process::{Command, Output};
use thiserror::Error;
use tracing::{debug, info};

/// Chain holding the per-interface rules in both tables.
pub const CHAIN_NAME: &str = "PEERPOD";

/// Comment attached to every rule.
pub const RULE_COMMENT: &str = "peerpod";

const IPTABLES_BIN: &str = "iptables";

/// `iptables -C` exit status for a rule that does not exist.
const EXIT_NOT_FOUND: i32 = 1;

/// iptables errors.
#[derive(Debug, Error)]
pub enum IptablesError {
    #[error("failed to execute iptables: {0}")]
    Command(io::Error),

    #[error("iptables {args} failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error(transparent)]
    Netops(#[from] peerpod_netops::NetopsError),
}

pub type Result<T> = std::result::Result<T, IptablesError>;

/// One rule: table, chain and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl IptablesRule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Rules for the routing tunneler: untracked and accepted traffic from each
/// of `interfaces`, plus the jumps into [`CHAIN_NAME`].
pub fn peerpod_rules(interfaces: &[&str]) -> Vec<IptablesRule> {
    let mut rules = Vec::new();

    for (table, hook, target) in [("raw", "PREROUTING", "NOTRACK"), ("filter", "FORWARD", "ACCEPT")] {
        for iface in interfaces {
            rules.push(IptablesRule::new(
                table,
                CHAIN_NAME,
                &["-i", iface, "-m", "comment", "--comment", RULE_COMMENT, "-j", target],
            ));
        }
        rules.push(IptablesRule::new(table, hook, &["-j", CHAIN_NAME]));
    }

    rules
}

/// Ensure every rule exists in `ns`, creating missing chains.
///
/// Rules already present are left alone, so applying the same rules again
/// changes nothing.
pub fn apply_rules(ns: &Ns, rules: &[IptablesRule]) -> Result<()> {
    ns.run(|| Ok(apply_rules_here(rules)))?
}

/// `iptables -S <chain>` output of `table` in `ns`.
pub fn list_rules(ns: &Ns, table: &str, chain: &str) -> Result<Vec<String>> {
    ns.run(|| {
        Ok(iptables(&["-t", table, "-S", chain]).map(|output| {
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect()
        }))
    })?
}

fn apply_rules_here(rules: &[IptablesRule]) -> Result<()> {
    for rule in rules {
        if !is_builtin_chain(rule.chain) && !chain_exists(rule.table, rule.chain)? {
            iptables(&["-t", rule.table, "-N", rule.chain])?;
            info!(table = rule.table, chain = rule.chain, "iptables chain created");
        }

        if rule_exists(rule)? {
            debug!(table = rule.table, chain = rule.chain, spec = ?rule.spec, "iptables rule already present");
            continue;
        }

        let mut args = vec!["-t", rule.table, "-A", rule.chain];
        args.extend(rule.spec.iter().map(String::as_str));
        iptables(&args)?;
        info!(table = rule.table, chain = rule.chain, spec = ?rule.spec, "iptables rule added");
    }
    Ok(())
}

fn chain_exists(table: &str, chain: &str) -> Result<bool> {
    let output = run(&["-t", table, "-S", chain])?;
    Ok(output.status.success())
}

fn rule_exists(rule: &IptablesRule) -> Result<bool> {
    let mut args = vec!["-t", rule.table, "-C", rule.chain];
    args.extend(rule.spec.iter().map(String::as_str));

    let output = run(&args)?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(EXIT_NOT_FOUND) => Ok(false),
        _ => Err(failure(&args, &output)),
    }
}

fn is_builtin_chain(chain: &str) -> bool {
    matches!(
        chain,
        "PREROUTING" | "INPUT" | "FORWARD" | "OUTPUT" | "POSTROUTING"
    )
}

/// Run iptables and fail on a non-zero exit status.
fn iptables(args: &[&str]) -> Result<Output> {
    let output = run(args)?;
    if !output.status.success() {
        return Err(failure(args, &output));
    }
    Ok(output)
}

fn run(args: &[&str]) -> Result<Output> {
    // -w waits for the xtables lock instead of failing
    Command::new(IPTABLES_BIN)
        .arg("-w")
        .args(args)
        .output()
        .map_err(IptablesError::Command)
}

fn failure(args: &[&str], output: &Output) -> IptablesError {
    IptablesError::Failed {
        args: args.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
