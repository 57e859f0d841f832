//! ufw driver
//!
//! Rule changes apply immediately. The numbered status only shows simple
//! port rules, so convergence for ufw resets the whole rule table instead
//! of deleting rules one by one.

use regex::Regex;
use std::sync::OnceLock;

use crate::exec::{CommandOutput, CommandSpec, RESET_TIMEOUT, RULE_TIMEOUT};
use crate::rules::{Port, Protocol, RuleSet};

use super::{Backend, FirewallDriver};

pub struct Ufw;

impl FirewallDriver for Ufw {
    fn backend(&self) -> Backend {
        Backend::Ufw
    }

    fn probe(&self) -> CommandSpec {
        CommandSpec::privileged("ufw", &["status"], RULE_TIMEOUT)
    }

    fn probe_active(&self, output: &CommandOutput) -> bool {
        output.stdout.contains("Status: active")
    }

    fn allow(&self, port: Port) -> CommandSpec {
        CommandSpec::privileged("ufw", &["allow"], RULE_TIMEOUT).with_arg(port.to_string())
    }

    fn revoke(&self, port: Port) -> Option<CommandSpec> {
        Some(
            CommandSpec::privileged("ufw", &["delete", "allow"], RULE_TIMEOUT)
                .with_arg(port.to_string()),
        )
    }

    fn commit(&self) -> Option<CommandSpec> {
        None
    }

    fn selective_removal(&self) -> bool {
        false
    }

    fn list(&self) -> CommandSpec {
        CommandSpec::privileged("ufw", &["status", "numbered"], RULE_TIMEOUT)
    }

    fn parse_listing(&self, listing: &str) -> RuleSet {
        parse_status_numbered(listing)
    }

    fn status(&self) -> CommandSpec {
        CommandSpec::privileged("ufw", &["status", "verbose"], RULE_TIMEOUT)
    }

    fn wipe(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::privileged("ufw", &["--force", "reset"], RESET_TIMEOUT)]
    }

    fn baseline(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::privileged("ufw", &["default", "deny", "incoming"], RULE_TIMEOUT),
            CommandSpec::privileged("ufw", &["default", "allow", "outgoing"], RULE_TIMEOUT),
        ]
    }

    fn enable(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::privileged("ufw", &["--force", "enable"], RULE_TIMEOUT)]
    }

    fn package(&self) -> &'static str {
        "ufw"
    }

    fn activate(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
}

fn allow_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:\[\s*\d+\]\s*)?(\d+)(?:/(tcp|udp))?\s+(?:\(v6\)\s+)?ALLOW\b")
            .expect("static regex")
    })
}

/// Parses `ufw status numbered` (or plain `ufw status`) output.
///
/// Incoming `ALLOW` rules on a single port are kept; a port without a
/// protocol suffix counts for both protocols. Ranges, application profiles
/// and outgoing rules are skipped.
pub fn parse_status_numbered(listing: &str) -> RuleSet {
    let mut rules = RuleSet::new();
    for line in listing.lines() {
        if line.contains("ALLOW OUT") || line.contains("ALLOW FWD") {
            continue;
        }
        let Some(caps) = allow_line().captures(line) else {
            continue;
        };
        let Some(number) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) else {
            continue;
        };
        match caps.get(2).map(|m| m.as_str()) {
            Some("tcp") => {
                rules.insert_number(number, Protocol::Tcp);
            }
            Some("udp") => {
                rules.insert_number(number, Protocol::Udp);
            }
            _ => rules.insert_both(number),
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUMBERED: &str = "\
Status: active

     To                         Action      From
     --                         ------      ----
[ 1] 22/tcp                     ALLOW IN    Anywhere
[ 2] 443                        ALLOW IN    Anywhere
[ 3] 8443/udp                   ALLOW IN    Anywhere
[ 4] 6000:6007/tcp              ALLOW IN    Anywhere
[ 5] OpenSSH                    ALLOW IN    Anywhere
[ 6] 25/tcp                     DENY IN     Anywhere
[ 7] 53/udp                     ALLOW OUT   Anywhere (out)
[ 8] 22/tcp (v6)                ALLOW IN    Anywhere (v6)
";

    #[test]
    fn test_parse_numbered() {
        let rules = parse_status_numbered(NUMBERED);
        let rendered: Vec<String> = rules.ports().iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["22/tcp", "443/tcp", "443/udp", "8443/udp"]);
    }

    #[test]
    fn test_parse_inactive() {
        assert!(parse_status_numbered("Status: inactive\n").is_empty());
    }

    #[test]
    fn test_commands() {
        let port = Port::tcp(443).unwrap();
        assert_eq!(Ufw.allow(port).command_line(), "ufw allow 443/tcp");
        assert_eq!(
            Ufw.revoke(port).unwrap().command_line(),
            "ufw delete allow 443/tcp"
        );
        assert!(Ufw.commit().is_none());
        assert!(!Ufw.selective_removal());
    }

    #[test]
    fn test_probe_active() {
        let output = CommandOutput {
            status: Some(0),
            stdout: "Status: active\n".into(),
            ..Default::default()
        };
        assert!(Ufw.probe_active(&output));

        let output = CommandOutput {
            status: Some(0),
            stdout: "Status: inactive\n".into(),
            ..Default::default()
        };
        assert!(!Ufw.probe_active(&output));
    }
}
