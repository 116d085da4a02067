//! SSH port-forward tunnels with readiness detection and cleanup.
//!
//! A tunnel is a background `ssh -L` process. It counts as established once
//! its verbose diagnostics (stderr) print [`READY_MARKER`]. Every live tunnel
//! process is tracked in a process-wide pid set so a Ctrl-C can terminate it;
//! on any other exit path the owning handle kills it when dropped.

use crate::config::Configuration;
use crate::error::{Error, Result, TunnelDetails};
use crate::executor::{self, HostTarget};
use crate::shell;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Printed by `ssh -v` once the session is interactively ready.
pub const READY_MARKER: &str = "Entering interactive session";

pub const DEFAULT_TIMEOUT_SECS: u64 = 45;

// ============================================================================
// Configuration
// ============================================================================

/// The `sshTunnel` block of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub bridge_user: String,
    pub bridge_host: String,
    #[serde(default)]
    pub dest_host: Option<String>,
    #[serde(default = "default_ssh_port", deserialize_with = "port")]
    pub bridge_port: u16,
    #[serde(default = "default_ssh_port", deserialize_with = "port")]
    pub dest_port: u16,
    #[serde(default = "default_local_port", deserialize_with = "port")]
    pub local_port: u16,
    #[serde(default = "default_strict")]
    pub strict_host_key_checking: bool,
    /// Readiness timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn port<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    executor::port_number(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("{} is not a valid port number", value)))
}

fn default_ssh_port() -> u16 {
    22
}

fn default_local_port() -> u16 {
    2022
}

fn default_strict() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl TunnelSpec {
    /// Read `sshTunnel` from a configuration; `None` when it declares none.
    pub fn from_configuration(config: &Configuration) -> Result<Option<Self>> {
        let Some(raw) = config.get("sshTunnel") else {
            return Ok(None);
        };
        let spec = serde_json::from_value(raw.clone()).map_err(|e| {
            Error::config_invalid_value(
                "sshTunnel",
                Some(config.name().to_string()),
                e.to_string(),
            )
        })?;
        Ok(Some(spec))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn forward(&self, dest_host: &str) -> String {
        format!("{}:{}:{}", self.local_port, dest_host, self.dest_port)
    }

    fn bridge(&self) -> String {
        format!("{}@{}", self.bridge_user, self.bridge_host)
    }

    fn ssh_prefix(&self) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        if !self.strict_host_key_checking {
            argv.extend(shell::no_strict_host_key_checking_args());
        }
        argv
    }

    fn bridge_port_args(&self) -> Vec<String> {
        if self.bridge_port == 22 {
            Vec::new()
        } else {
            vec!["-p".to_string(), self.bridge_port.to_string()]
        }
    }

    /// argv of a single-hop forward from this machine through the bridge.
    pub fn direct_command(&self, dest_host: &str) -> Vec<String> {
        let mut argv = self.ssh_prefix();
        argv.push("-vAN".to_string());
        argv.push("-L".to_string());
        argv.push(self.forward(dest_host));
        argv.extend(self.bridge_port_args());
        argv.push(self.bridge());
        argv
    }

    /// argv that logs into `relay` and opens the bridge forward there, so the
    /// relay host reaches the destination on its own `localhost:<localPort>`.
    pub fn relayed_command(&self, dest_host: &str, relay: &HostTarget) -> Vec<String> {
        let mut remote = self.ssh_prefix();
        remote.push("-v".to_string());
        remote.push("-L".to_string());
        remote.push(self.forward(dest_host));
        remote.extend(self.bridge_port_args());
        remote.push(self.bridge());
        remote.extend(["-A", "-N", "-M"].map(String::from));

        let mut argv = vec!["ssh".to_string()];
        if !relay.strict_host_key_checking {
            argv.extend(shell::no_strict_host_key_checking_args());
        }
        if let Some(identity) = &relay.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.clone());
        }
        argv.push("-vA".to_string());
        argv.push("-p".to_string());
        argv.push(relay.port.to_string());
        argv.push(format!("{}@{}", relay.user, relay.host));
        argv.push(remote.join(" "));
        argv
    }
}

// ============================================================================
// Process registry
// ============================================================================

fn live_pids() -> &'static Mutex<BTreeSet<u32>> {
    static PIDS: OnceLock<Mutex<BTreeSet<u32>>> = OnceLock::new();
    PIDS.get_or_init(|| Mutex::new(BTreeSet::new()))
}

fn track(pid: u32) {
    live_pids()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(pid);
}

fn untrack(pid: u32) {
    live_pids()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&pid);
}

/// Pids of tunnel processes still running.
#[cfg(test)]
pub(crate) fn live_tunnel_pids() -> Vec<u32> {
    live_pids()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .copied()
        .collect()
}

/// Send SIGTERM to every tracked tunnel process.
pub fn terminate_all() {
    let pids: Vec<u32> = std::mem::take(&mut *live_pids().lock().unwrap_or_else(|e| e.into_inner()))
        .into_iter()
        .collect();
    for pid in pids {
        terminate(pid);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Terminate tracked tunnels on Ctrl-C, then exit with 130.
pub fn install_exit_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        terminate_all();
        std::process::exit(130);
    })
    .map_err(|e| Error::internal_unexpected(format!("Failed to install Ctrl-C handler: {}", e)))
}

// ============================================================================
// Readiness
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    TimedOut,
    /// The stream ended before the marker appeared; reported at the deadline.
    Closed,
}

/// Consume lines until one contains `marker` or `timeout` elapses. A stream
/// that closes early still holds the caller until the deadline.
pub(crate) fn wait_for_marker(lines: &Receiver<String>, marker: &str, timeout: Duration) -> Readiness {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Readiness::TimedOut;
        }
        match lines.recv_timeout(remaining) {
            Ok(line) if line.contains(marker) => return Readiness::Ready,
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) => return Readiness::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return Readiness::Closed;
            }
        }
    }
}

/// A running tunnel process, killed on drop.
#[derive(Debug)]
pub struct TunnelProcess {
    child: Child,
}

impl TunnelProcess {
    /// Spawn `argv` and block until it reports readiness.
    pub fn establish(argv: &[String], timeout: Duration, details: TunnelDetails) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| Error::internal_unexpected("empty tunnel command"))?;
        let description = argv.join(" ");
        log_status!("tunnel", "{}", description);

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::internal_io(e.to_string(), Some(format!("spawn {}", program))))?;
        track(child.id());

        let (tx, rx) = mpsc::channel();
        if let Some(stderr) = child.stderr.take() {
            // Keeps draining after readiness so a chatty `ssh -v` never blocks.
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    let _ = tx.send(line);
                }
            });
        }

        let mut process = Self { child };
        match wait_for_marker(&rx, READY_MARKER, timeout) {
            Readiness::Ready => Ok(process),
            Readiness::TimedOut => {
                process.kill();
                Err(Error::tunnel_timeout(TunnelDetails {
                    timeout_secs: Some(timeout.as_secs()),
                    ..details
                }))
            }
            Readiness::Closed => {
                process.kill();
                Err(Error::tunnel_timeout(TunnelDetails {
                    timeout_secs: Some(timeout.as_secs()),
                    reason: Some("tunnel process exited before it became ready".to_string()),
                    ..details
                }))
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn kill(&mut self) {
        untrack(self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

// ============================================================================
// Tunnels
// ============================================================================

/// An established tunnel. Dropping it tears every hop down.
#[derive(Debug)]
pub enum Tunnel {
    Direct(TunnelProcess),
    /// The hop opened on the relay host, then the local-facing hop.
    Relayed {
        remote: TunnelProcess,
        local: TunnelProcess,
    },
}

impl Tunnel {
    pub fn direct(spec: &TunnelSpec, dest_host: &str, config_name: &str) -> Result<Self> {
        let process = TunnelProcess::establish(
            &spec.direct_command(dest_host),
            spec.timeout(),
            details(spec, config_name),
        )?;
        Ok(Tunnel::Direct(process))
    }

    /// Open the hop on `relay` first, then the local hop. Each hop gets the
    /// full readiness timeout.
    pub fn relayed(
        spec: &TunnelSpec,
        dest_host: &str,
        relay: &HostTarget,
        config_name: &str,
    ) -> Result<Self> {
        let remote = TunnelProcess::establish(
            &spec.relayed_command(dest_host, relay),
            spec.timeout(),
            details(spec, config_name),
        )?;
        let local = TunnelProcess::establish(
            &spec.direct_command(dest_host),
            spec.timeout(),
            details(spec, config_name),
        )?;
        Ok(Tunnel::Relayed { remote, local })
    }

    pub fn pids(&self) -> Vec<u32> {
        match self {
            Tunnel::Direct(process) => vec![process.pid()],
            Tunnel::Relayed { remote, local } => vec![remote.pid(), local.pid()],
        }
    }
}

fn details(spec: &TunnelSpec, config_name: &str) -> TunnelDetails {
    TunnelDetails {
        config_name: config_name.to_string(),
        local_port: spec.local_port,
        timeout_secs: None,
        reason: None,
    }
}

/// Lifecycle of one tunnel slot during a run.
#[derive(Debug, Default)]
pub enum TunnelState {
    #[default]
    NotNeeded,
    Establishing,
    Established(Tunnel),
    /// Terminal for the run; later preflights do not retry.
    Failed(String),
}

impl TunnelState {
    #[cfg(test)]
    pub(crate) fn is_established(&self) -> bool {
        matches!(self, TunnelState::Established(_))
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, TunnelState::Established(_) | TunnelState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TunnelState::NotNeeded => "not-needed",
            TunnelState::Establishing => "establishing",
            TunnelState::Established(_) => "established",
            TunnelState::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn spec() -> TunnelSpec {
        serde_json::from_value(serde_json::json!({
            "bridgeUser": "jump",
            "bridgeHost": "bastion.example.com",
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults() {
        let spec = spec();
        assert_eq!(spec.bridge_port, 22);
        assert_eq!(spec.dest_port, 22);
        assert_eq!(spec.local_port, 2022);
        assert!(spec.strict_host_key_checking);
        assert_eq!(spec.timeout(), Duration::from_secs(45));
        assert_eq!(spec.dest_host, None);
    }

    #[test]
    fn spec_is_read_from_configuration() {
        let config = Configuration::new("live", &["ssh"]);
        assert_eq!(TunnelSpec::from_configuration(&config).unwrap(), None);

        let config = config.with(
            "sshTunnel",
            serde_json::json!({ "bridgeUser": "jump", "bridgeHost": "b", "timeout": 5 }),
        );
        let spec = TunnelSpec::from_configuration(&config).unwrap().unwrap();
        assert_eq!(spec.timeout, 5);

        let config = Configuration::new("bad", &[])
            .with("sshTunnel", serde_json::json!({ "bridgeHost": "b" }));
        let err = TunnelSpec::from_configuration(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn ports_may_be_numeric_strings() {
        let config = Configuration::new("live", &["ssh"]).with(
            "sshTunnel",
            serde_json::json!({
                "bridgeUser": "jump",
                "bridgeHost": "b",
                "bridgePort": "2200",
                "localPort": "5022",
            }),
        );
        let spec = TunnelSpec::from_configuration(&config).unwrap().unwrap();
        assert_eq!(spec.bridge_port, 2200);
        assert_eq!(spec.local_port, 5022);
        assert_eq!(spec.dest_port, 22);

        let config = Configuration::new("live", &["ssh"]).with(
            "sshTunnel",
            serde_json::json!({ "bridgeUser": "jump", "bridgeHost": "b", "localPort": "ssh" }),
        );
        let err = TunnelSpec::from_configuration(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn direct_command_forwards_through_bridge() {
        assert_eq!(
            spec().direct_command("10.0.0.5").join(" "),
            "ssh -vAN -L 2022:10.0.0.5:22 jump@bastion.example.com"
        );

        let mut relaxed = spec();
        relaxed.strict_host_key_checking = false;
        relaxed.bridge_port = 2200;
        let argv = relaxed.direct_command("db");
        assert_eq!(argv[1..3], ["-o", "StrictHostKeyChecking=no"]);
        assert!(argv.windows(2).any(|w| w == ["-p", "2200"]));
    }

    #[test]
    fn relayed_command_nests_the_bridge_hop() {
        let relay = HostTarget::new("deploy", "stage.example.com", 2222);
        let argv = spec().relayed_command("10.0.0.5", &relay);
        assert_eq!(
            argv[..5],
            ["ssh", "-vA", "-p", "2222", "deploy@stage.example.com"]
        );
        assert_eq!(
            argv[5],
            "ssh -v -L 2022:10.0.0.5:22 jump@bastion.example.com -A -N -M"
        );
        assert_eq!(argv.len(), 6);
    }

    #[test]
    fn relayed_command_logs_in_with_the_relay_options() {
        let mut relay = HostTarget::new("deploy", "stage.example.com", 2222);
        relay.identity_file = Some("~/.ssh/stage".to_string());
        relay.strict_host_key_checking = false;
        let argv = spec().relayed_command("10.0.0.5", &relay);

        assert_eq!(argv[1..3], ["-o", "StrictHostKeyChecking=no"]);
        assert!(argv.windows(2).any(|w| w == ["-i", "~/.ssh/stage"]));
        assert!(argv.windows(2).any(|w| w == ["-p", "2222"]));
        let remote = argv.last().unwrap();
        assert!(remote.starts_with("ssh -v -L "));
        assert!(!remote.contains("StrictHostKeyChecking"));
        assert!(!remote.contains("-i "));
    }

    #[test]
    fn marker_emitted_before_timeout_is_ready() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            tx.send("debug1: Connecting".to_string()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            tx.send(format!("debug1: {}.", READY_MARKER)).unwrap();
            std::thread::sleep(Duration::from_secs(2));
        });

        let start = Instant::now();
        let readiness = wait_for_marker(&rx, READY_MARKER, Duration::from_secs(2));
        let elapsed = start.elapsed();
        assert_eq!(readiness, Readiness::Ready);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn missing_marker_times_out_never_early() {
        let (tx, rx) = mpsc::channel::<String>();
        let _keep_open = tx.clone();
        std::thread::spawn(move || {
            for _ in 0..10 {
                let _ = tx.send("debug1: still waiting".to_string());
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let readiness = wait_for_marker(&rx, READY_MARKER, timeout);
        let elapsed = start.elapsed();
        assert_eq!(readiness, Readiness::TimedOut);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn closed_stream_waits_out_the_timeout() {
        let (tx, rx) = mpsc::channel::<String>();
        drop(tx);
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        assert_eq!(wait_for_marker(&rx, READY_MARKER, timeout), Readiness::Closed);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[cfg(unix)]
    #[test]
    fn process_is_tracked_until_dropped() {
        let script = format!("echo '{}' >&2; sleep 30", READY_MARKER);
        let argv = vec!["sh".to_string(), "-c".to_string(), script];

        let process = TunnelProcess::establish(
            &argv,
            Duration::from_secs(5),
            details(&spec(), "test"),
        )
        .unwrap();
        let pid = process.pid();
        assert!(live_tunnel_pids().contains(&pid));

        drop(process);
        assert!(!live_tunnel_pids().contains(&pid));
    }

    #[cfg(unix)]
    #[test]
    fn silent_process_times_out_and_is_killed() {
        let argv: Vec<String> = ["sh", "-c", "sleep 30"].iter().map(|s| s.to_string()).collect();
        let start = Instant::now();
        let err = TunnelProcess::establish(
            &argv,
            Duration::from_millis(300),
            details(&spec(), "test"),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelTimeout);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(err.details["localPort"], 2022);
    }

    #[cfg(unix)]
    #[test]
    fn process_exiting_early_fails_at_the_timeout() {
        let script = "echo 'ssh: connect to host bastion port 22: Connection refused' >&2; exit 255";
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let err = TunnelProcess::establish(&argv, timeout, details(&spec(), "test")).unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelTimeout);
        assert!(start.elapsed() >= timeout);
        assert_eq!(
            err.details["reason"],
            "tunnel process exited before it became ready"
        );
    }

    #[test]
    fn failed_state_is_settled() {
        let state = TunnelState::Failed("timeout".to_string());
        assert!(state.is_settled());
        assert!(!state.is_established());
        assert_eq!(TunnelState::default().label(), "not-needed");
    }
}
