//! Runs `dockerHosts` scripts for an environment's container and resolves the
//! container address for tunnels.

use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::{scalar_entries, DockerHost};
use crate::error::{Error, Result};
use crate::executor::{CommandRequest, HostTarget};
use crate::script::{self, Callbacks, Replacements, ScriptInterpreter};
use crate::shell;
use crate::ssh::execute_local_command_interactive;
use serde_json::{Map, Value};

/// Subtask forwarding a container's port 80 to this machine instead of
/// running a script.
const REMOTE_ACCESS: &str = "startRemoteAccess";

pub struct DockerMethod {
    capabilities: Capabilities<Self>,
}

impl Default for DockerMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("docker", Self::docker)
                .with("getIpAddress", Self::get_ip_address),
        }
    }

    fn docker(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let subtask = args
            .param("subtask")
            .map(str::to_string)
            .or_else(|| args.positional.first().cloned())
            .ok_or_else(|| Error::validation_missing_argument(vec!["subtask".to_string()]))?;

        let (block, host) = docker_setup(ctx)?;
        let container = container_name(ctx, block)?;

        if subtask == REMOTE_ACCESS {
            return start_remote_access(ctx, &host, &container, args);
        }

        log_status!(
            "docker",
            "Running task '{}' on guest-host '{}' for container '{}'",
            subtask,
            host.host,
            container
        );

        let commands = script::expand(&host.tasks, &subtask)?;
        let kwargs = args.params.iter().filter(|(key, _)| key.as_str() != "subtask");
        let lines = Replacements::new()
            .guest(ctx.config)
            .docker_host(&host)
            .entries(&scalar_entries(block))
            .entries(kwargs)
            .apply(&commands);

        let orchestrator = ctx.orchestrator;
        let config = ctx.config;
        let callbacks = Callbacks::builtin().with("execute_host_task", move |_, call_args: &[String]| {
            let (task, rest) = call_args
                .split_first()
                .ok_or_else(|| Error::validation_missing_argument(vec!["task".to_string()]))?;
            let mut task_args = TaskArgs::new().with_positional(rest.to_vec());
            orchestrator.run_task(config, task, &mut task_args)
        });

        let run = ScriptInterpreter::new(ctx.orchestrator.executor(), HostTarget::for_docker_host(&host))
            .run(&host.root_folder, &lines, &callbacks)?;
        args.set_result("failures", run.failures().to_string());
        Ok(())
    }

    fn get_ip_address(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        if !ctx.config.contains("docker") {
            return Ok(());
        }
        let (block, host) = docker_setup(ctx)?;
        let container = container_name(ctx, block)?;

        match container_ip(ctx, &host, &container)? {
            Some(ip) => args.set_result("ip", ip),
            None => log_status!("docker", "Docker not running, can't get ip of {}", container),
        }
        Ok(())
    }
}

fn docker_setup<'a>(ctx: &HookContext<'a>) -> Result<(&'a Map<String, Value>, DockerHost)> {
    let block = ctx.config.block("docker").ok_or_else(|| {
        Error::config_missing_key("docker", Some(ctx.config.name().to_string()))
    })?;
    let id = block
        .get("configuration")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::config_missing_key("docker/configuration", Some(ctx.config.name().to_string()))
        })?;
    let host = ctx.orchestrator.settings().docker_host(id)?;
    Ok((block, host))
}

fn container_name(ctx: &HookContext<'_>, block: &Map<String, Value>) -> Result<String> {
    block
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::config_missing_key("docker/name", Some(ctx.config.name().to_string())))
}

fn container_ip(ctx: &HookContext<'_>, host: &DockerHost, container: &str) -> Result<Option<String>> {
    let request = CommandRequest::new(format!("docker inspect {}", shell::quote_arg(container)))
        .captured()
        .tolerant();
    let output = ctx
        .orchestrator
        .executor()
        .run(&HostTarget::for_docker_host(host), &request)?;
    if !output.success {
        return Ok(None);
    }
    Ok(parse_container_ip(&output.stdout))
}

/// Pull the first non-empty `IPAddress` out of `docker inspect` output.
pub fn parse_container_ip(inspect: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(inspect).ok()?;
    let settings = parsed.get(0)?.get("NetworkSettings")?;

    let non_empty = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    };

    non_empty(settings.get("IPAddress")).or_else(|| {
        settings
            .get("Networks")?
            .as_object()?
            .values()
            .find_map(|network| non_empty(network.get("IPAddress")))
    })
}

fn start_remote_access(
    ctx: &HookContext<'_>,
    host: &DockerHost,
    container: &str,
    args: &TaskArgs,
) -> Result<()> {
    let ip = container_ip(ctx, host, container)?.ok_or_else(|| {
        Error::validation_invalid_argument("docker/name", "Could not get docker-ip-address")
    })?;
    let public_ip = args.param("public_ip").unwrap_or("0.0.0.0");

    log_status!(
        "docker",
        "Starting port forwarding via SSH; type exit after the prompt when finished"
    );
    let command = format!(
        "ssh -L{}:8888:{}:80 -p {} {}@{}",
        public_ip, ip, host.port, host.user, host.host
    );
    let exit_code = execute_local_command_interactive(&command);
    if exit_code != 0 {
        log_status!("docker", "Port forwarding ended with exit code {}", exit_code);
    }
    Ok(())
}

impl HookProvider for DockerMethod {
    fn method_name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
