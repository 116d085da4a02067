//! Host-side scripts stored in the configuration, run around the built-in
//! tasks (`deployPrepare`, `reset`, `backupFinished`, ...) or by name.

use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::{Configuration, Settings};
use crate::error::{Error, Result};
use crate::script::{self, Callbacks, Replacements, ScriptInterpreter};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Configuration keys holding scripts run as part of a task.
const TASK_HOOKS: &[&str] = &[
    "deployPrepare",
    "deploy",
    "deployFinished",
    "resetPrepare",
    "reset",
    "resetFinished",
    "backupPrepare",
    "backup",
    "backupFinished",
];

pub struct ScriptMethod {
    capabilities: Capabilities<Self>,
}

impl Default for ScriptMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptMethod {
    pub fn new() -> Self {
        let capabilities = TASK_HOOKS
            .iter()
            .fold(Capabilities::new(), |caps, hook| caps.with(*hook, Self::task_hook))
            .with("script", Self::script);
        Self { capabilities }
    }

    fn task_hook(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let Some(lines) = ctx.config.lines(ctx.hook) else {
            return Ok(());
        };
        let commands = script::expand_lines(&scripts(ctx.settings(), ctx.config), &lines)?;
        run_script(ctx, args, &commands)
    }

    fn script(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let name = args
            .param("script")
            .map(str::to_string)
            .or_else(|| args.positional.first().cloned())
            .ok_or_else(|| Error::validation_missing_argument(vec!["script".to_string()]))?;
        let commands = script::expand(&scripts(ctx.settings(), ctx.config), &name)?;
        run_script(ctx, args, &commands)
    }
}

/// Named scripts: global `scripts` overlaid with the environment's own.
pub fn scripts(settings: &Settings, config: &Configuration) -> BTreeMap<String, Vec<String>> {
    let mut table = BTreeMap::new();
    for block in [settings.block("scripts"), config.block("scripts")]
        .into_iter()
        .flatten()
    {
        collect_scripts(block, &mut table);
    }
    table
}

fn collect_scripts(block: &Map<String, Value>, table: &mut BTreeMap<String, Vec<String>>) {
    for (name, lines) in block {
        if let Some(items) = lines.as_array() {
            let lines = items
                .iter()
                .filter_map(crate::config::scalar_to_string)
                .collect();
            table.insert(name.clone(), lines);
        }
    }
}

fn run_script(ctx: &HookContext<'_>, args: &mut TaskArgs, commands: &[String]) -> Result<()> {
    let config = ctx.config;
    let lines = Replacements::new()
        .scalars(config)
        .entries(&args.params)
        .apply(commands);

    let orchestrator = ctx.orchestrator;
    let callbacks = Callbacks::builtin().with("run_docker_task", move |_, call_args: &[String]| {
        let subtask = call_args
            .first()
            .ok_or_else(|| Error::validation_missing_argument(vec!["subtask".to_string()]))?;
        let mut docker_args = TaskArgs::new().with_param("subtask", subtask.as_str());
        orchestrator.call("docker", "docker", config, &mut docker_args)
    });

    let root = config.require_string("rootFolder")?;
    log_status!("script", "Running script on {} ({} lines)", config.name(), lines.len());
    let run = ScriptInterpreter::new(ctx.orchestrator.executor(), ctx.target()?)
        .run(&root, &lines, &callbacks)?;
    args.set_result("failures", run.failures().to_string());
    Ok(())
}

impl HookProvider for ScriptMethod {
    fn method_name(&self) -> &str {
        "script"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
