//! Backend installation for hosts without an active firewall.

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::error::GuardResult;
use crate::exec::{CommandRunner, CommandSpec, PACKAGE_TIMEOUT, QUERY_TIMEOUT};
use crate::rules::RuleSet;

use super::{Backend, FirewallAdapter, FirewallDriver};

/// Distribution family, as far as package management is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFamily {
    Debian,
    Rhel,
    Unknown,
}

const DEBIAN_MARKERS: [&str; 2] = ["ubuntu", "debian"];
const RHEL_MARKERS: [&str; 5] = ["centos", "rhel", "fedora", "rocky", "almalinux"];

impl PackageFamily {
    /// Classifies the contents of an os-release file.
    pub fn from_os_release(content: &str) -> Self {
        let content = content.to_ascii_lowercase();
        if DEBIAN_MARKERS.iter().any(|m| content.contains(m)) {
            PackageFamily::Debian
        } else if RHEL_MARKERS.iter().any(|m| content.contains(m)) {
            PackageFamily::Rhel
        } else {
            PackageFamily::Unknown
        }
    }

    pub fn detect(os_release: &Path) -> Self {
        match std::fs::read_to_string(os_release) {
            Ok(content) => Self::from_os_release(&content),
            Err(e) => {
                warn!("Cannot read {}: {e}", os_release.display());
                PackageFamily::Unknown
            }
        }
    }

    /// The backend this family gets.
    pub fn backend(&self) -> Backend {
        match self {
            PackageFamily::Debian => Backend::Ufw,
            PackageFamily::Rhel => Backend::Firewalld,
            PackageFamily::Unknown => Backend::None,
        }
    }

    /// Package manager commands installing `package`.
    pub async fn install_commands(
        &self,
        runner: &dyn CommandRunner,
        package: &str,
    ) -> Vec<CommandSpec> {
        match self {
            PackageFamily::Debian => vec![
                CommandSpec::privileged("apt-get", &["update"], PACKAGE_TIMEOUT)
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
                CommandSpec::privileged("apt-get", &["install", "-y"], PACKAGE_TIMEOUT)
                    .with_arg(package)
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
            ],
            PackageFamily::Rhel => {
                let manager = rhel_package_manager(runner).await;
                vec![CommandSpec::privileged(manager, &["install", "-y"], PACKAGE_TIMEOUT)
                    .with_arg(package)]
            }
            PackageFamily::Unknown => Vec::new(),
        }
    }
}

/// `dnf` when installed, `yum` otherwise.
async fn rhel_package_manager(runner: &dyn CommandRunner) -> &'static str {
    let probe = CommandSpec::new("which", &["dnf"], QUERY_TIMEOUT);
    match runner.run(&probe).await {
        Ok(output) if output.success() => "dnf",
        _ => "yum",
    }
}

impl FirewallAdapter {
    /// Installs and enables the family's backend with a default-deny
    /// baseline that keeps `keep_open` reachable.
    ///
    /// Returns the new backend, or [`Backend::None`] when the family is
    /// unknown or any step fails. Only a successful install replaces the
    /// cached backend.
    pub async fn install(&mut self, os_release: &Path, keep_open: &RuleSet) -> Backend {
        let family = PackageFamily::detect(os_release);
        let Some(driver) = family.backend().driver() else {
            warn!("Unsupported distribution, no firewall installed");
            return Backend::None;
        };

        info!(
            "Installing {} for the {:?} family (keeping {keep_open} open)",
            driver.package(),
            family
        );
        let package_steps = family
            .install_commands(self.runner().as_ref(), driver.package())
            .await;
        match self.install_with(driver, &package_steps, keep_open).await {
            Ok(()) => {
                let backend = driver.backend();
                info!("Firewall backend installed: {backend}");
                self.set_backend(backend);
                backend
            }
            Err(e) => {
                error!("Firewall installation failed: {e}");
                Backend::None
            }
        }
    }

    async fn install_with(
        &self,
        driver: &dyn FirewallDriver,
        package_steps: &[CommandSpec],
        keep_open: &RuleSet,
    ) -> GuardResult<()> {
        let steps = package_steps
            .iter()
            .cloned()
            .chain(driver.activate())
            .chain(driver.wipe())
            .chain(driver.baseline())
            .chain(keep_open.ports().into_iter().map(|port| driver.allow(port)))
            .chain(driver.commit())
            .chain(driver.enable());

        for step in steps {
            self.execute(&step).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Port;
    use crate::testing::ScriptedRunner;
    use std::io::Write;
    use std::sync::Arc;

    const UBUNTU: &str = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";
    const ROCKY: &str = "NAME=\"Rocky Linux\"\nID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";

    fn os_release(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn ssh_only() -> RuleSet {
        RuleSet::from_ports([Port::tcp(2222).unwrap()])
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(PackageFamily::from_os_release(UBUNTU), PackageFamily::Debian);
        assert_eq!(PackageFamily::from_os_release(ROCKY), PackageFamily::Rhel);
        assert_eq!(PackageFamily::from_os_release("ID=alpine\n"), PackageFamily::Unknown);
        assert_eq!(
            PackageFamily::detect(Path::new("/nonexistent/os-release")),
            PackageFamily::Unknown
        );
    }

    #[tokio::test]
    async fn test_install_debian() {
        let file = os_release(UBUNTU);
        let runner = Arc::new(ScriptedRunner::new().ok("apt-get", "").ok("ufw", ""));
        let mut fw = FirewallAdapter::new(runner.clone(), Backend::None);

        let backend = fw.install(file.path(), &ssh_only()).await;
        assert_eq!(backend, Backend::Ufw);
        assert_eq!(fw.backend(), Backend::Ufw);
        assert_eq!(
            runner.calls(),
            vec![
                "apt-get update",
                "apt-get install -y ufw",
                "ufw --force reset",
                "ufw default deny incoming",
                "ufw default allow outgoing",
                "ufw allow 2222/tcp",
                "ufw --force enable",
            ]
        );
    }

    #[tokio::test]
    async fn test_install_rhel_prefers_dnf() {
        let file = os_release(ROCKY);
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("which dnf", "/usr/bin/dnf\n")
                .ok("dnf", "")
                .ok("systemctl", "")
                .ok("firewall-cmd", ""),
        );
        let mut fw = FirewallAdapter::new(runner.clone(), Backend::None);

        assert_eq!(fw.install(file.path(), &ssh_only()).await, Backend::Firewalld);
        assert_eq!(
            runner.calls(),
            vec![
                "which dnf",
                "dnf install -y firewalld",
                "systemctl enable --now firewalld",
                "firewall-cmd --set-default-zone=public",
                "firewall-cmd --permanent --add-port 2222/tcp",
                "firewall-cmd --reload",
            ]
        );
    }

    #[tokio::test]
    async fn test_install_rhel_falls_back_to_yum() {
        let file = os_release(ROCKY);
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("which dnf", 1, "")
                .ok("yum", "")
                .ok("systemctl", "")
                .ok("firewall-cmd", ""),
        );
        let mut fw = FirewallAdapter::new(runner.clone(), Backend::None);
        fw.install(file.path(), &ssh_only()).await;
        assert!(runner.calls().contains(&"yum install -y firewalld".to_string()));
    }

    #[tokio::test]
    async fn test_install_step_failure_aborts() {
        let file = os_release(UBUNTU);
        let runner = Arc::new(
            ScriptedRunner::new()
                .ok("apt-get update", "")
                .on("apt-get install", 100, ""),
        );
        let mut fw = FirewallAdapter::new(runner.clone(), Backend::None);

        assert_eq!(fw.install(file.path(), &ssh_only()).await, Backend::None);
        assert_eq!(fw.backend(), Backend::None);
        assert!(!runner.calls().iter().any(|c| c.starts_with("ufw")));
    }

    #[tokio::test]
    async fn test_install_unknown_family() {
        let file = os_release("ID=alpine\n");
        let runner = Arc::new(ScriptedRunner::new());
        let mut fw = FirewallAdapter::new(runner.clone(), Backend::None);
        assert_eq!(fw.install(file.path(), &ssh_only()).await, Backend::None);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_debian_commands_are_noninteractive() {
        let runner = ScriptedRunner::new();
        let steps = PackageFamily::Debian.install_commands(&runner, "ufw").await;
        assert!(steps
            .iter()
            .all(|s| s.env.contains(&("DEBIAN_FRONTEND".into(), "noninteractive".into()))));
        assert!(steps.iter().all(|s| s.timeout == PACKAGE_TIMEOUT));
    }
}
