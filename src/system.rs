use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use zbus::{zvariant::OwnedObjectPath, Connection, Proxy};

use crate::errors::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
}

impl PackageManager {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "apt" | "apt-get" => Some(Self::Apt),
            "yum" => Some(Self::Yum),
            "dnf" => Some(Self::Dnf),
            _ => None,
        }
    }

    /// Command that reports the package's installation state.
    pub fn query_command(&self, package: &str) -> CommandSpec {
        match self {
            Self::Apt => CommandSpec::new("dpkg-query").args(["-W", "--showformat=${Status}", package]),
            Self::Yum | Self::Dnf => CommandSpec::new("rpm").args(["-q", package]),
        }
    }

    /// Interprets the output of a successful [`query_command`](Self::query_command).
    ///
    /// dpkg also knows packages that were removed but not purged, so only the
    /// `installed` state counts.
    pub fn reports_installed(&self, output: &CommandOutput) -> bool {
        match self {
            Self::Apt => output.stdout.trim() == "install ok installed",
            Self::Yum | Self::Dnf => true,
        }
    }

    pub fn install_command(&self, package: &str) -> CommandSpec {
        match self {
            Self::Apt => CommandSpec::new("apt-get")
                .args(["install", "-y", "-q", package])
                .env("DEBIAN_FRONTEND", "noninteractive"),
            Self::Yum => CommandSpec::new("yum").args(["install", "-y", package]),
            Self::Dnf => CommandSpec::new("dnf").args(["install", "-y", package]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Start,
    Reload,
}

impl ServiceAction {
    fn manager_method(&self) -> &'static str {
        match self {
            Self::Enable => "EnableUnitFiles",
            Self::Start => "StartUnit",
            Self::Reload => "ReloadUnit",
        }
    }
}

/// Idempotence predicate evaluated before a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Guard {
    #[default]
    Always,
    UnlessExists(PathBuf),
    OnlyIfExists(PathBuf),
}

impl Guard {
    pub fn should_run(&self) -> bool {
        match self {
            Self::Always => true,
            Self::UnlessExists(path) => !exists(path),
            Self::OnlyIfExists(path) => exists(path),
        }
    }
}

// Dangling symlinks count as present.
fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub guard: Guard,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn unless_exists(mut self, path: impl Into<PathBuf>) -> Self {
        self.guard = Guard::UnlessExists(path.into());
        self
    }

    pub fn only_if_exists(mut self, path: impl Into<PathBuf>) -> Self {
        self.guard = Guard::OnlyIfExists(path.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
}

#[async_trait]
pub trait SystemManager: Send + Sync {
    /// Installs a package unless present; returns whether anything changed.
    async fn install_package(&self, package: &str) -> Result<bool, ProvisionError>;
    /// Applies `action` to `unit`; returns whether the unit's state changed.
    async fn service(&self, unit: &str, action: ServiceAction) -> Result<bool, ProvisionError>;
    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, ProvisionError>;
}

/// Runs `command` unless its guard says the work is already done.
pub async fn run_guarded(
    system: &dyn SystemManager,
    command: &CommandSpec,
) -> Result<bool, ProvisionError> {
    if !command.guard.should_run() {
        debug!(command = %command.display(), guard = ?command.guard, "guard satisfied, skipping");
        return Ok(false);
    }

    system.run_command(command).await?;
    Ok(true)
}

/// Package manager, systemd and process execution of the local host.
#[derive(Debug, Clone)]
pub struct HostSystem {
    package_manager: PackageManager,
}

impl HostSystem {
    pub fn new(package_manager: PackageManager) -> Self {
        Self { package_manager }
    }
}

pub fn ensure_systemd_available() -> Result<(), ProvisionError> {
    if Path::new("/run/systemd/system").is_dir() {
        Ok(())
    } else {
        Err(ProvisionError::systemd("systemd is not running on this host"))
    }
}

/// `nagios3` becomes `nagios3.service`; explicit unit suffixes are kept.
pub fn unit_name(name: &str) -> String {
    const SUFFIXES: [&str; 4] = [".service", ".socket", ".target", ".timer"];
    if SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

async fn manager_proxy() -> Result<Proxy<'static>, ProvisionError> {
    let connection = Connection::system()
        .await
        .map_err(|err| ProvisionError::systemd(format!("failed to connect to system dbus: {err}")))?;

    Proxy::new(
        &connection,
        "org.freedesktop.systemd1",
        "/org/freedesktop/systemd1",
        "org.freedesktop.systemd1.Manager",
    )
    .await
    .map_err(|err| ProvisionError::systemd(format!("failed to create systemd dbus proxy: {err}")))
}

async fn active_state(manager: &Proxy<'static>, unit: &str) -> Result<String, zbus::Error> {
    let path: OwnedObjectPath = manager.call("LoadUnit", &(unit,)).await?;
    let unit_proxy = Proxy::new(
        manager.connection(),
        "org.freedesktop.systemd1",
        path.as_str(),
        "org.freedesktop.systemd1.Unit",
    )
    .await?;
    unit_proxy.get_property("ActiveState").await
}

#[async_trait]
impl SystemManager for HostSystem {
    async fn install_package(&self, package: &str) -> Result<bool, ProvisionError> {
        let query = self.package_manager.query_command(package);
        let installed = match self.run_command(&query).await {
            Ok(output) => self.package_manager.reports_installed(&output),
            // Unknown packages make the query exit non-zero.
            Err(ProvisionError::CommandFailed { .. }) => false,
            Err(err) => return Err(err),
        };
        if installed {
            debug!(package, "package already installed");
            return Ok(false);
        }

        self.run_command(&self.package_manager.install_command(package))
            .await?;
        info!(package, "package installed");
        Ok(true)
    }

    async fn service(&self, unit: &str, action: ServiceAction) -> Result<bool, ProvisionError> {
        let unit = unit_name(unit);
        let proxy = manager_proxy().await?;
        let method = action.manager_method();
        let failed = |err: zbus::Error| ProvisionError::systemd(format!("{method} {unit}: {err}"));

        let changed = match action {
            ServiceAction::Enable => {
                let (_carries_install_info, changes): (bool, Vec<(String, String, String)>) = proxy
                    .call(method, &(vec![unit.as_str()], false, true))
                    .await
                    .map_err(failed)?;
                if !changes.is_empty() {
                    let _: () = proxy.call("Reload", &()).await.map_err(failed)?;
                }
                !changes.is_empty()
            }
            ServiceAction::Start | ServiceAction::Reload => {
                if action == ServiceAction::Start
                    && active_state(&proxy, &unit).await.map_err(failed)? == "active"
                {
                    false
                } else {
                    let _job: OwnedObjectPath = proxy
                        .call(method, &(unit.as_str(), "replace"))
                        .await
                        .map_err(failed)?;
                    true
                }
            }
        };

        if changed {
            info!(unit = %unit, action = ?action, "service action queued");
        } else {
            debug!(unit = %unit, action = ?action, "service already in desired state");
        }
        Ok(changed)
    }

    async fn run_command(&self, command: &CommandSpec) -> Result<CommandOutput, ProvisionError> {
        let mut process = Command::new(&command.program);
        process.args(&command.args);
        process.envs(command.env.iter().map(|(key, value)| (key, value)));
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }

        debug!(command = %command.display(), "running command");
        let output = process
            .output()
            .await
            .map_err(|err| ProvisionError::io("failed to run", &command.program, err))?;

        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command: command.display(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
