//! Opens the SSH tunnels an environment (or the environment it copies from)
//! declares in `sshTunnel`, once per run.

use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::executor::HostTarget;
use crate::tunnel::{Tunnel, TunnelSpec, TunnelState};
use std::cell::{Cell, RefCell};

const SOURCE_TASKS: &[&str] = &["copyDBFrom", "copyFilesFrom"];

pub struct SshMethod {
    capabilities: Capabilities<Self>,
    /// Set while a preflight runs; nested preflights (from address lookup)
    /// return immediately.
    creating: Cell<bool>,
    own: RefCell<TunnelState>,
    source: RefCell<TunnelState>,
}

impl Default for SshMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl SshMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new().with("preflight", Self::preflight),
            creating: Cell::new(false),
            own: RefCell::new(TunnelState::NotNeeded),
            source: RefCell::new(TunnelState::NotNeeded),
        }
    }

    #[cfg(test)]
    pub(crate) fn own_state(&self) -> &'static str {
        self.own.borrow().label()
    }

    #[cfg(test)]
    pub(crate) fn source_state(&self) -> &'static str {
        self.source.borrow().label()
    }

    fn preflight(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        if self.creating.replace(true) {
            return Ok(());
        }
        let result = self.open_tunnels(ctx, args);
        self.creating.set(false);
        result
    }

    fn open_tunnels(&self, ctx: &HookContext<'_>, args: &TaskArgs) -> Result<()> {
        if ctx.config.contains("sshTunnel") && !self.own.borrow().is_settled() {
            log_status!("tunnel", "Establishing SSH tunnel for {}", ctx.config.name());
            self.establish(&self.own, ctx, ctx.config, None)?;
        }

        if !SOURCE_TASKS.contains(&ctx.task) {
            return Ok(());
        }
        let Some(source) = args.source_config.as_ref() else {
            return Ok(());
        };
        if source.contains("sshTunnel") && !self.source.borrow().is_settled() {
            log_status!("tunnel", "Establishing SSH tunnel to source {}", source.name());
            let relay = ctx.target()?;
            self.establish(&self.source, ctx, source, Some(&relay))?;
        }
        Ok(())
    }

    /// Drive one slot to Established or Failed. Only protocol errors escape;
    /// tunnel failures, including an unreadable `sshTunnel` block, are logged
    /// and recorded.
    fn establish(
        &self,
        slot: &RefCell<TunnelState>,
        ctx: &HookContext<'_>,
        config: &Configuration,
        relay: Option<&HostTarget>,
    ) -> Result<()> {
        let outcome = match TunnelSpec::from_configuration(config) {
            Ok(Some(spec)) => {
                *slot.borrow_mut() = TunnelState::Establishing;
                open(ctx, config, &spec, relay)
            }
            Ok(None) => {
                *slot.borrow_mut() = TunnelState::NotNeeded;
                return Ok(());
            }
            Err(err) => Err(err),
        };

        let state = match outcome {
            Ok(tunnel) => {
                log_status!("tunnel", "Tunnel is established (pids {:?})", tunnel.pids());
                TunnelState::Established(tunnel)
            }
            Err(err) if err.is_protocol_error() => {
                *slot.borrow_mut() = TunnelState::Failed(err.message.clone());
                return Err(err);
            }
            Err(err) => {
                log_status!("tunnel", "Tunnel for {} failed: {}", config.name(), err.message);
                TunnelState::Failed(err.message)
            }
        };
        *slot.borrow_mut() = state;
        Ok(())
    }
}

/// Resolve the destination and spawn the tunnel processes.
fn open(
    ctx: &HookContext<'_>,
    config: &Configuration,
    spec: &TunnelSpec,
    relay: Option<&HostTarget>,
) -> Result<Tunnel> {
    let dest_host = match &spec.dest_host {
        Some(host) => host.clone(),
        None => resolve_address(ctx, config)?,
    };

    match relay {
        Some(relay) => Tunnel::relayed(spec, &dest_host, relay, config.name()),
        None => Tunnel::direct(spec, &dest_host, config.name()),
    }
}

/// Ask the other methods of `config` for its address via `getIpAddress`.
fn resolve_address(ctx: &HookContext<'_>, config: &Configuration) -> Result<String> {
    log_status!("tunnel", "Getting remote ip-address from available methods");
    let mut lookup = TaskArgs::new();
    ctx.orchestrator
        .run_task(config, "getIpAddress", &mut lookup)?;
    lookup
        .result("ip")
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::tunnel_address_unresolved(config.name()))
}

impl HookProvider for SshMethod {
    fn method_name(&self) -> &str {
        "ssh"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
