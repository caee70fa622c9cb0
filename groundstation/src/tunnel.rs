//! Provisioning tunnel: installs, starts, stops and removes the satellite on
//! a workstation over ssh.
//!
//! Every operation validates the credential bundle first and fails with
//! [`TunnelError::InvalidConfig`] before touching the network. Failures are
//! returned with the operation, host and step attached; nothing is retried
//! here.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::monitor::Recovery;

const SATELLITE_BIN: &str = "satellite";
const SATELLITE_CONFIG: &str = "satellite.toml";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to run ssh: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("`{command}` exited with status {status:?}: {stderr}")]
    Remote {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("reading satellite binary {path}: {source}")]
    Binary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rendering satellite config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("{op} {host}: {step}: {source}")]
    Step {
        op: &'static str,
        host: String,
        step: &'static str,
        #[source]
        source: ShellError,
    },
}

impl TunnelError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

fn default_install_dir() -> String {
    "satellite-{login}".into()
}
fn default_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_heartbeat() -> u64 {
    30
}
fn default_stats() -> u64 {
    60
}

/// Credential bundle and remote layout, as read from the `[tunnel]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    pub login: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    /// Relative to the login's home directory; `{login}` is substituted.
    pub install_dir: String,
    pub satellite_binary: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// URL the installed satellite reports to.
    pub groundstation_url: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            login: None,
            identity_file: None,
            known_hosts: None,
            install_dir: default_install_dir(),
            satellite_binary: None,
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            groundstation_url: None,
            heartbeat_interval_secs: default_heartbeat(),
            stats_interval_secs: default_stats(),
        }
    }
}

/// Where and as whom to connect, for the lifetime of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub login: String,
    pub identity_file: PathBuf,
    pub known_hosts: PathBuf,
    pub port: u16,
    pub connect_timeout: Duration,
}

/// Contents of the `satellite.toml` written next to the installed binary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SatelliteSettings {
    pub hostname: String,
    pub groundstation_url: String,
    pub heartbeat_interval_secs: u64,
    pub stats_interval_secs: u64,
}

#[derive(Debug)]
struct Plan {
    target: Target,
    install_dir: String,
    binary: PathBuf,
    settings: SatelliteSettings,
}

fn required<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T, TunnelError> {
    field
        .as_ref()
        .ok_or_else(|| TunnelError::invalid(format!("`{name}` is not set")))
}

fn plain_word(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

impl TunnelConfig {
    /// Render the install directory for `login`.
    pub fn install_dir_for(&self, login: &str) -> String {
        self.install_dir.replace("{login}", login)
    }

    fn plan(&self, host: &str) -> Result<Plan, TunnelError> {
        let login = required(&self.login, "login")?;
        let identity_file = required(&self.identity_file, "identity_file")?;
        let known_hosts = required(&self.known_hosts, "known_hosts")?;
        let binary = required(&self.satellite_binary, "satellite_binary")?;
        let url = required(&self.groundstation_url, "groundstation_url")?;
        if !plain_word(login) {
            return Err(TunnelError::invalid(format!("bad login {login:?}")));
        }
        if !plain_word(host) {
            return Err(TunnelError::invalid(format!("bad host {host:?}")));
        }
        // one directory per operator, so two people onboarding the same box never collide
        if !self.install_dir.contains("{login}") {
            return Err(TunnelError::invalid("`install_dir` must contain {login}"));
        }
        let install_dir = self.install_dir_for(login);
        if install_dir.split('/').any(|part| part == "..") {
            return Err(TunnelError::invalid("`install_dir` must not contain `..`"));
        }
        Ok(Plan {
            target: Target {
                host: host.to_string(),
                login: login.clone(),
                identity_file: identity_file.clone(),
                known_hosts: known_hosts.clone(),
                port: self.port,
                connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            },
            install_dir,
            binary: binary.clone(),
            settings: SatelliteSettings {
                hostname: host.to_string(),
                groundstation_url: url.clone(),
                heartbeat_interval_secs: self.heartbeat_interval_secs,
                stats_interval_secs: self.stats_interval_secs,
            },
        })
    }
}

/// Single-quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` through the remote login shell and return its stdout.
    async fn run(&self, target: &Target, command: &str) -> Result<String, ShellError>;

    /// Write `contents` to `remote_path` and set its permission bits.
    async fn upload(
        &self,
        target: &Target,
        contents: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ShellError>;
}

/// The system OpenSSH client. Key auth only; unknown host keys are rejected.
#[derive(Debug, Default, Clone)]
pub struct OpenSsh;

impl OpenSsh {
    fn command(target: &Target, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(ssh_args(target, remote))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

pub(crate) fn ssh_args(target: &Target, remote: &str) -> Vec<String> {
    vec![
        "-i".into(),
        target.identity_file.display().to_string(),
        "-p".into(),
        target.port.to_string(),
        "-l".into(),
        target.login.clone(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "StrictHostKeyChecking=yes".into(),
        "-o".into(),
        format!("UserKnownHostsFile={}", target.known_hosts.display()),
        "-o".into(),
        format!("ConnectTimeout={}", target.connect_timeout.as_secs()),
        "--".into(),
        target.host.clone(),
        remote.to_string(),
    ]
}

fn check(command: &str, output: std::process::Output) -> Result<String, ShellError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ShellError::Remote {
            command: command.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl RemoteShell for OpenSsh {
    async fn run(&self, target: &Target, command: &str) -> Result<String, ShellError> {
        let output = Self::command(target, command)
            .stdin(Stdio::null())
            .output()
            .await?;
        check(command, output)
    }

    async fn upload(
        &self,
        target: &Target,
        contents: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ShellError> {
        let tmp = format!("{remote_path}.part");
        let command = format!(
            "cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {dst}",
            tmp = shell_quote(&tmp),
            dst = shell_quote(remote_path),
        );
        let mut child = Self::command(target, &command)
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        check(&command, output).map(|_| ())
    }
}

pub struct Tunnel {
    config: TunnelConfig,
    shell: Arc<dyn RemoteShell>,
}

fn launch_command(dir: &str) -> String {
    format!(
        "cd {dir} && nohup ./{SATELLITE_BIN} --config {SATELLITE_CONFIG} \
         > satellite.out 2> satellite.err < /dev/null &",
        dir = shell_quote(dir),
    )
}

fn stop_command() -> String {
    format!("pkill -u \"$(id -u)\" -x {SATELLITE_BIN} || true")
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_shell(config, Arc::new(OpenSsh))
    }

    pub fn with_shell(config: TunnelConfig, shell: Arc<dyn RemoteShell>) -> Self {
        Self { config, shell }
    }

    /// Validate the bundle for `host` without connecting.
    pub fn check(&self, host: &str) -> Result<(), TunnelError> {
        self.config.plan(host).map(|_| ())
    }

    async fn step(
        &self,
        op: &'static str,
        step: &'static str,
        target: &Target,
        command: &str,
    ) -> Result<String, TunnelError> {
        self.shell
            .run(target, command)
            .await
            .map_err(|source| TunnelError::Step {
                op,
                host: target.host.clone(),
                step,
                source,
            })
    }

    async fn put(
        &self,
        op: &'static str,
        step: &'static str,
        target: &Target,
        contents: &[u8],
        path: &str,
        mode: u32,
    ) -> Result<(), TunnelError> {
        self.shell
            .upload(target, contents, path, mode)
            .await
            .map_err(|source| TunnelError::Step {
                op,
                host: target.host.clone(),
                step,
                source,
            })
    }

    /// Install the satellite and its config on `host`, then start it.
    pub async fn onboard(&self, host: &str) -> Result<(), TunnelError> {
        const OP: &str = "onboard";
        let plan = self.config.plan(host)?;
        let binary = tokio::fs::read(&plan.binary)
            .await
            .map_err(|source| TunnelError::Binary {
                path: plan.binary.clone(),
                source,
            })?;
        let settings = toml::to_string(&plan.settings)?;
        let dir = &plan.install_dir;
        let target = &plan.target;
        info!(host, dir = %dir, "onboarding");

        // a satellite left over from an earlier install would keep reporting
        self.step(OP, "stop satellite", target, &stop_command())
            .await?;
        self.step(
            OP,
            "create install directory",
            target,
            &format!("mkdir -p {}", shell_quote(dir)),
        )
        .await?;
        self.put(
            OP,
            "upload satellite binary",
            target,
            &binary,
            &format!("{dir}/{SATELLITE_BIN}"),
            0o755,
        )
        .await?;
        self.put(
            OP,
            "upload satellite config",
            target,
            settings.as_bytes(),
            &format!("{dir}/{SATELLITE_CONFIG}"),
            0o644,
        )
        .await?;
        self.step(OP, "launch satellite", target, &launch_command(dir))
            .await?;
        info!(host, "onboarded");
        Ok(())
    }

    /// Kill any running satellite and launch the installed one again.
    pub async fn restart_satellite(&self, host: &str) -> Result<(), TunnelError> {
        const OP: &str = "restart";
        let plan = self.config.plan(host)?;
        self.step(OP, "stop satellite", &plan.target, &stop_command())
            .await?;
        self.step(
            OP,
            "launch satellite",
            &plan.target,
            &launch_command(&plan.install_dir),
        )
        .await?;
        info!(host, "satellite restarted");
        Ok(())
    }

    /// Kill the satellite, leaving the installation in place.
    pub async fn stop_satellite(&self, host: &str) -> Result<(), TunnelError> {
        let plan = self.config.plan(host)?;
        self.step("stop", "stop satellite", &plan.target, &stop_command())
            .await?;
        info!(host, "satellite stopped");
        Ok(())
    }

    /// Kill the satellite and delete its install directory.
    pub async fn deboard(&self, host: &str) -> Result<(), TunnelError> {
        const OP: &str = "deboard";
        let plan = self.config.plan(host)?;
        let dir = shell_quote(&plan.install_dir);
        self.step(OP, "stop satellite", &plan.target, &stop_command())
            .await?;
        self.step(
            OP,
            "remove install directory",
            &plan.target,
            &format!("rm -rf -- {dir}"),
        )
        .await?;
        info!(host, "deboarded");
        Ok(())
    }
}

#[async_trait]
impl Recovery for Tunnel {
    async fn restart(&self, host: &str) -> Result<(), TunnelError> {
        self.restart_satellite(host).await
    }
}
