//! Listening-socket table and sshd_config parsing.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":(\d+)\s").expect("static regex"))
}

/// Ports from `ss -tlnp` / `netstat -tlnp` lines mentioning `process_name`.
///
/// Only the first `:<digits><whitespace>` match of a line counts, which is
/// the local address column in both tools. Lines without a match are skipped.
pub fn parse_socket_table(table: &str, process_name: &str) -> BTreeSet<u16> {
    table
        .lines()
        .filter(|line| line.contains(process_name))
        .filter_map(|line| port_pattern().captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .filter(|&port| port != 0)
        .collect()
}

/// The first `Port` directive of an sshd_config, if any.
pub fn parse_sshd_port(config: &str) -> Option<u16> {
    config
        .lines()
        .map(str::trim)
        .find(|line| line.to_ascii_lowercase().starts_with("port "))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|&port| port != 0)
}
