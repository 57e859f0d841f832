//! Host facts for the status report.

use std::path::Path;
use tracing::debug;

use crate::exec::{CommandRunner, CommandSpec, QUERY_TIMEOUT};

const FALLBACK_TIMEZONE: &str = "Etc/UTC";

/// The kernel hostname, or `unknown`.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Zone name from `timedatectl` output (`Time zone: Europe/Berlin (CET, +0100)`).
pub fn parse_timedatectl(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Time zone:"))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// System timezone: `timedatectl`, then `timezone_file`, then `Etc/UTC`.
pub async fn timezone(runner: &dyn CommandRunner, timezone_file: &Path) -> String {
    let spec = CommandSpec::new("timedatectl", &[], QUERY_TIMEOUT);
    match runner.run(&spec).await {
        Ok(output) if output.success() => {
            if let Some(zone) = parse_timedatectl(&output.stdout) {
                return zone;
            }
        }
        Ok(_) => debug!("timedatectl failed, reading {}", timezone_file.display()),
        Err(e) => debug!("timedatectl unavailable: {e}"),
    }

    std::fs::read_to_string(timezone_file)
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|zone| !zone.is_empty())
        .unwrap_or_else(|| FALLBACK_TIMEZONE.to_string())
}
