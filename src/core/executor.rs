//! Remote command execution - routes to the local shell or SSH per target.

use crate::config::{Configuration, DockerHost};
use crate::error::{Error, RemoteCommandFailedDetails, Result, TargetDetails};
use crate::shell;
use crate::ssh::{OutputMode, SshClient};
use serde::Serialize;
use std::fmt;

pub use crate::ssh::CommandOutput;

/// Where a command runs: a login on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    pub strict_host_key_checking: bool,
    /// The host/port pair is the local end of a tunnel, so `localhost` must
    /// still be reached over SSH.
    pub via_tunnel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
}

impl HostTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            identity_file: None,
            strict_host_key_checking: true,
            via_tunnel: false,
            config_name: None,
        }
    }

    pub fn via_tunnel(mut self) -> Self {
        self.via_tunnel = true;
        self
    }

    /// Derive the login of an environment. Environments behind an `sshTunnel`
    /// are reached through the local end of the tunnel.
    pub fn for_configuration(config: &Configuration) -> Result<Self> {
        let user = config.require_string("user")?;
        let identity_file = config.string("identityFile");

        let mut target = match config.block("sshTunnel") {
            Some(tunnel) => {
                let port = match tunnel.get("localPort") {
                    Some(value) => parse_port("sshTunnel/localPort", value)?,
                    None => 2022,
                };
                let strict = tunnel
                    .get("strictHostKeyChecking")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                let mut target = Self::new(user, "localhost", port).via_tunnel();
                target.strict_host_key_checking = strict;
                target
            }
            None => {
                let host = config.require_string("host")?;
                let port = match config.get("port") {
                    Some(value) => parse_port("port", value)?,
                    None => 22,
                };
                Self::new(user, host, port)
            }
        };

        target.identity_file = identity_file;
        target.config_name = Some(config.name().to_string());
        Ok(target)
    }

    pub fn for_docker_host(docker_host: &DockerHost) -> Self {
        let mut target = Self::new(
            docker_host.user.clone(),
            docker_host.host.clone(),
            docker_host.port,
        );
        target.identity_file = docker_host.identity_file.clone();
        target.config_name = Some(format!("dockerHosts/{}", docker_host.id));
        target
    }

    fn details(&self, cwd: Option<&str>) -> TargetDetails {
        TargetDetails {
            config_name: self.config_name.clone(),
            host: Some(self.to_string()),
            cwd: cwd.map(str::to_string),
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// A port given as a JSON number or a numeric string.
pub(crate) fn port_number(value: &serde_json::Value) -> Option<u16> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
}

fn parse_port(key: &str, value: &serde_json::Value) -> Result<u16> {
    port_number(value).ok_or_else(|| {
        Error::config_invalid_value(key, Some(value.to_string()), "not a valid port number")
    })
}

/// One command to run on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: Option<String>,
    /// Capture stdout/stderr instead of streaming them to the terminal.
    pub capture: bool,
    /// A non-zero exit is reported as a warning instead of an error.
    pub tolerate_failure: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            capture: false,
            tolerate_failure: false,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Set tolerance from a runtime flag, e.g. a script's `warn_only` state.
    pub fn tolerating(mut self, tolerate: bool) -> Self {
        self.tolerate_failure = tolerate;
        self
    }
}

/// Executes commands on hosts.
///
/// `execute` reports the raw outcome; only failures to run the command at all
/// are errors. `run` applies the request's failure policy on top.
pub trait RemoteExecutor {
    fn execute(&self, target: &HostTarget, request: &CommandRequest) -> Result<CommandOutput>;

    fn run(&self, target: &HostTarget, request: &CommandRequest) -> Result<CommandOutput> {
        let output = self.execute(target, request)?;
        if output.success {
            return Ok(output);
        }

        if request.tolerate_failure {
            log_status!(
                "warning",
                "Command failed on {} (exit {}), continuing: {}",
                target,
                output.exit_code,
                request.command
            );
            return Ok(output);
        }

        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: request.command.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            target: target.details(request.cwd.as_deref()),
        }))
    }
}

/// Executor backed by `ssh`, or the local shell for local hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshExecutor;

impl SshExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, target: &HostTarget, request: &CommandRequest) -> Result<CommandOutput> {
        let client = SshClient::from_target(target)?;
        let command = match &request.cwd {
            Some(dir) => shell::in_dir(dir, &request.command),
            None => request.command.clone(),
        };
        let mode = if request.capture {
            OutputMode::Capture
        } else {
            OutputMode::Stream
        };

        log_status!("ssh", "{} $ {}", target, request.command);
        Ok(client.execute(&command, mode))
    }
}
