use crate::error::{Error, Result};
use crate::executor::HostTarget;
use crate::utils::shell;
use serde::Serialize;
use std::process::{Command, Stdio};

pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub strict_host_key_checking: bool,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the host is localhost/127.0.0.1/::1 and no
    /// tunnel port is involved.
    pub is_local: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            success: false,
            exit_code: -1,
        }
    }
}

/// Whether command output is captured or streamed to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Capture,
    /// Remote stdout and stderr both go to our stderr, keeping stdout free for
    /// the JSON response.
    Stream,
}

impl SshClient {
    pub fn from_target(target: &HostTarget) -> Result<Self> {
        if target.host.is_empty() || target.user.is_empty() {
            return Err(Error::config_missing_key(
                if target.host.is_empty() { "host" } else { "user" },
                target.config_name.clone(),
            ));
        }

        let identity_file = match &target.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !std::path::Path::new(&expanded).exists() {
                    return Err(Error::config_invalid_value(
                        "identityFile",
                        Some(expanded),
                        "SSH identity file not found",
                    ));
                }
                Some(expanded)
            }
            _ => None,
        };

        let is_local = is_local_host(&target.host) && !target.via_tunnel;

        Ok(Self {
            host: target.host.clone(),
            user: target.user.clone(),
            port: target.port,
            identity_file,
            strict_host_key_checking: target.strict_host_key_checking,
            is_local,
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Agent forwarding so remote git/scp can reuse local keys.
        args.push("-A".to_string());

        if !self.strict_host_key_checking {
            args.extend(shell::no_strict_host_key_checking_args());
        }

        // Never prompt; fail fast on stalled connections.
        args.extend(
            [
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "ServerAliveInterval=15",
                "-o",
                "ServerAliveCountMax=3",
            ]
            .map(String::from),
        );

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }

    pub fn execute(&self, command: &str, mode: OutputMode) -> CommandOutput {
        self.execute_with_retry(command, mode, 3)
    }

    fn execute_with_retry(&self, command: &str, mode: OutputMode, max_attempts: u32) -> CommandOutput {
        let backoff_secs = [0, 2, 5]; // delays before retry 1, 2, 3

        for attempt in 0..max_attempts {
            let result = self.execute_once(command, mode);

            // Only retry on transient connection errors, not command failures
            if result.success || attempt + 1 >= max_attempts || !is_transient_ssh_error(&result) {
                return result;
            }

            let delay = backoff_secs.get(attempt as usize + 1).copied().unwrap_or(5);
            log_status!(
                "ssh",
                "Connection failed (attempt {}/{}), retrying in {}s...",
                attempt + 1,
                max_attempts,
                delay
            );
            std::thread::sleep(std::time::Duration::from_secs(delay));
        }

        CommandOutput::failed("SSH retry exhausted")
    }

    fn execute_once(&self, command: &str, mode: OutputMode) -> CommandOutput {
        if self.is_local {
            return execute_local_command_in_dir(command, None, mode);
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(command));
        run_command(cmd, mode, "SSH error")
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    let cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    cmd
}

fn run_command(mut cmd: Command, mode: OutputMode, context: &str) -> CommandOutput {
    match mode {
        OutputMode::Capture => match cmd.output() {
            Ok(out) => CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                success: out.status.success(),
                exit_code: out.status.code().unwrap_or(-1),
            },
            Err(e) => CommandOutput::failed(format!("{}: {}", context, e)),
        },
        OutputMode::Stream => {
            cmd.stdout(Stdio::from(std::io::stderr()));
            cmd.stderr(Stdio::inherit());
            match cmd.status() {
                Ok(status) => CommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    success: status.success(),
                    exit_code: status.code().unwrap_or(-1),
                },
                Err(e) => CommandOutput::failed(format!("{}: {}", context, e)),
            }
        }
    }
}

pub fn execute_local_command_in_dir(
    command: &str,
    current_dir: Option<&str>,
    mode: OutputMode,
) -> CommandOutput {
    let mut cmd = shell_command(command);

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    run_command(cmd, mode, "Command error")
}

pub fn execute_local_command_interactive(command: &str) -> i32 {
    let status = shell_command(command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status();

    match status {
        Ok(s) => s.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Check if an SSH failure is a transient connection error worth retrying.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(port: u16, strict: bool) -> SshClient {
        SshClient {
            host: "example.com".to_string(),
            user: "deploy".to_string(),
            port,
            identity_file: None,
            strict_host_key_checking: strict,
            is_local: false,
        }
    }

    #[test]
    fn ssh_args_include_port_only_when_non_default() {
        let args = client(22, true).build_ssh_args("ls");
        assert!(!args.contains(&"-p".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ls"));

        let args = client(2222, true).build_ssh_args("uptime");
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert_eq!(args[args.len() - 2], "deploy@example.com");
    }

    #[test]
    fn relaxed_host_key_checking_adds_options() {
        let args = client(22, false).build_ssh_args("ls");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn tunnelled_localhost_is_not_treated_as_local() {
        let target = HostTarget::new("deploy", "localhost", 2022).via_tunnel();
        let client = SshClient::from_target(&target).unwrap();
        assert!(!client.is_local);

        let target = HostTarget::new("deploy", "127.0.0.1", 22);
        assert!(SshClient::from_target(&target).unwrap().is_local);
    }

    #[test]
    fn transient_errors_are_detected() {
        let output = CommandOutput {
            exit_code: 255,
            ..CommandOutput::default()
        };
        assert!(is_transient_ssh_error(&output));

        let output = CommandOutput {
            exit_code: 1,
            stderr: "No such file".to_string(),
            ..CommandOutput::default()
        };
        assert!(!is_transient_ssh_error(&output));
    }

    #[cfg(unix)]
    #[test]
    fn local_command_captures_output_in_dir() {
        let output = execute_local_command_in_dir("pwd", Some("/"), OutputMode::Capture);
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "/");

        let output = execute_local_command_in_dir("exit 3", None, OutputMode::Capture);
        assert_eq!(output.exit_code, 3);
        assert!(!output.success);
    }
}
