use clap::Args;

use fabalicious::operations::TaskOutput;

use super::{parse_params, with_operations, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct DockerArgs {
    /// Configuration name
    pub config: String,

    /// Script name from the docker host's tasks, or startRemoteAccess
    pub subtask: String,

    /// Extra replacements as key=value
    #[arg(trailing_var_arg = true)]
    pub params: Vec<String>,
}

#[derive(Args)]
pub struct CommandArgs {
    /// Configuration name
    pub config: String,

    /// Command line passed to the tool
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct ScriptArgs {
    /// Configuration name
    pub config: String,

    /// Script name from `scripts`
    pub script: String,

    /// Extra replacements as key=value
    #[arg(trailing_var_arg = true)]
    pub params: Vec<String>,
}

#[derive(Args)]
pub struct NotifyArgs {
    /// Configuration name
    pub config: String,

    /// Message text
    #[arg(trailing_var_arg = true, required = true)]
    pub message: Vec<String>,
}

/// `startRemoteAccess` forwards a port and keeps an interactive ssh session.
pub fn is_interactive(args: &DockerArgs) -> bool {
    args.subtask == "startRemoteAccess"
}

pub fn docker(args: DockerArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    let params = parse_params(&args.params)?;
    with_operations(global, |ops| ops.docker(&args.config, &args.subtask, params))
}

pub fn drush(args: CommandArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.drush(&args.config, &args.command.join(" ")))
}

pub fn drupalconsole(args: CommandArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| {
        ops.drupalconsole(&args.config, &args.command.join(" "))
    })
}

pub fn composer(args: CommandArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.composer(&args.config, &args.command.join(" ")))
}

pub fn script(args: ScriptArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    let params = parse_params(&args.params)?;
    with_operations(global, |ops| ops.script(&args.config, &args.script, params))
}

pub fn notify(args: NotifyArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.notify(&args.config, &args.message.join(" ")))
}
