//! firewalld driver (`firewall-cmd`)
//!
//! Rules are written to the permanent configuration and take effect on
//! `--reload`, so several changes can share one commit.

use crate::exec::{CommandOutput, CommandSpec, QUERY_TIMEOUT, RESET_TIMEOUT, RULE_TIMEOUT};
use crate::rules::{Port, RuleSet};

use super::{Backend, FirewallDriver};

pub struct Firewalld;

impl FirewallDriver for Firewalld {
    fn backend(&self) -> Backend {
        Backend::Firewalld
    }

    fn probe(&self) -> CommandSpec {
        CommandSpec::new("systemctl", &["is-active", "firewalld"], QUERY_TIMEOUT)
    }

    fn probe_active(&self, output: &CommandOutput) -> bool {
        output.success() && output.stdout.contains("active")
    }

    fn allow(&self, port: Port) -> CommandSpec {
        CommandSpec::privileged("firewall-cmd", &["--permanent", "--add-port"], RULE_TIMEOUT)
            .with_arg(port.to_string())
    }

    fn revoke(&self, port: Port) -> Option<CommandSpec> {
        Some(
            CommandSpec::privileged("firewall-cmd", &["--permanent", "--remove-port"], RULE_TIMEOUT)
                .with_arg(port.to_string()),
        )
    }

    fn commit(&self) -> Option<CommandSpec> {
        Some(CommandSpec::privileged("firewall-cmd", &["--reload"], RULE_TIMEOUT))
    }

    fn selective_removal(&self) -> bool {
        true
    }

    fn list(&self) -> CommandSpec {
        CommandSpec::privileged("firewall-cmd", &["--list-ports"], RULE_TIMEOUT)
    }

    fn parse_listing(&self, listing: &str) -> RuleSet {
        parse_list_ports(listing)
    }

    fn status(&self) -> CommandSpec {
        CommandSpec::privileged("firewall-cmd", &["--list-all"], RULE_TIMEOUT)
    }

    fn wipe(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    fn baseline(&self) -> Vec<CommandSpec> {
        // The public zone rejects unsolicited incoming traffic and leaves
        // outgoing traffic alone.
        vec![CommandSpec::privileged(
            "firewall-cmd",
            &["--set-default-zone=public"],
            RULE_TIMEOUT,
        )]
    }

    fn enable(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    fn package(&self) -> &'static str {
        "firewalld"
    }

    fn activate(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::privileged(
            "systemctl",
            &["enable", "--now", "firewalld"],
            RESET_TIMEOUT,
        )]
    }
}

/// Parses `firewall-cmd --list-ports` output (`443/tcp 8443/udp ...`).
/// Port ranges and unknown tokens are skipped.
pub fn parse_list_ports(listing: &str) -> RuleSet {
    listing
        .split_whitespace()
        .filter_map(|token| token.parse::<Port>().ok())
        .collect()
}
