//! Version control on the environment's git checkout.

use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::executor::CommandRequest;

pub struct GitMethod {
    capabilities: Capabilities<Self>,
}

impl Default for GitMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl GitMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("getVersion", Self::get_version)
                .with("backupPrepare", Self::backup_prepare)
                .with("deploy", Self::deploy),
        }
    }

    fn get_version(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let version = current_version(ctx)?;
        args.set_result("version", version);
        Ok(())
    }

    /// Prefix backup file names with the deployed version.
    fn backup_prepare(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let version = current_version(ctx)?;
        let base = args
            .param("baseName")
            .map(str::to_string)
            .unwrap_or_else(|| super::default_base_name(ctx.config));
        args.params
            .insert("baseName".to_string(), format!("{}--{}", version, base));
        Ok(())
    }

    fn deploy(&self, ctx: &HookContext<'_>, _args: &mut TaskArgs) -> Result<()> {
        let folder = root_folder(ctx.config)?;
        let branch = ctx.config.require_string("branch")?;

        let diff = ctx.run(
            CommandRequest::new("git diff --exit-code --quiet")
                .in_dir(&folder)
                .captured()
                .tolerant(),
        )?;
        if !diff.success {
            ctx.run(CommandRequest::new("git status").in_dir(&folder).tolerant())?;
            return Err(Error::git_working_copy_dirty(ctx.config.name(), folder));
        }

        let pull_options = ctx
            .config
            .block("gitOptions")
            .and_then(|options| options.get("pull"))
            .and_then(|pull| pull.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(crate::config::scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let mut commands = vec![
            "git fetch -q origin".to_string(),
            format!("git checkout {}", branch),
            "git fetch --tags".to_string(),
            pull_command(&pull_options, &branch),
        ];
        if !ctx.config.flag("ignoreSubmodules", false) {
            commands.push("git submodule init".to_string());
            commands.push("git submodule sync".to_string());
            commands.push("git submodule update --init --recursive".to_string());
        }

        for command in commands {
            ctx.run(CommandRequest::new(command).in_dir(&folder))?;
        }
        Ok(())
    }
}

fn root_folder(config: &Configuration) -> Result<String> {
    config
        .string("gitRootFolder")
        .or_else(|| config.string("rootFolder"))
        .ok_or_else(|| Error::config_missing_key("gitRootFolder", Some(config.name().to_string())))
}

fn pull_command(options: &str, branch: &str) -> String {
    if options.is_empty() {
        format!("git pull -q origin {}", branch)
    } else {
        format!("git pull -q {} origin {}", options, branch)
    }
}

/// `git describe` output usable in file names.
fn current_version(ctx: &HookContext<'_>) -> Result<String> {
    let folder = root_folder(ctx.config)?;
    let output = ctx.run(
        CommandRequest::new("git describe --always")
            .in_dir(&folder)
            .captured(),
    )?;
    Ok(normalize_version(&output.stdout))
}

pub fn normalize_version(describe: &str) -> String {
    describe
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
        .replace('/', "-")
}

impl HookProvider for GitMethod {
    fn method_name(&self) -> &str {
        "git"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
