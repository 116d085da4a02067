use clap::Args;

use fabalicious::operations::TaskOutput;

use super::{parse_params, with_operations, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ResetArgs {
    /// Configuration name
    pub config: String,

    /// Reset the admin password (development configurations only)
    #[arg(long)]
    pub with_password_reset: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    /// Configuration name
    pub config: String,

    /// Skip the reset that normally follows a deploy
    #[arg(long)]
    pub no_reset: bool,
}

#[derive(Args)]
pub struct BackupArgs {
    /// Configuration name
    pub config: String,

    /// Back up the database only
    #[arg(long)]
    pub without_files: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Configuration name
    pub config: String,
}

#[derive(Args)]
pub struct RunArgs {
    /// Configuration name
    pub config: String,

    /// Task to run through preflight, prepare, main, finished and postflight
    pub task: String,

    /// Task parameters as key=value
    #[arg(trailing_var_arg = true)]
    pub params: Vec<String>,
}

pub fn reset(args: ResetArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.reset(&args.config, args.with_password_reset))
}

pub fn deploy(args: DeployArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.deploy(&args.config, !args.no_reset))
}

pub fn backup(args: BackupArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.backup(&args.config, !args.without_files))
}

pub fn backup_db(args: ConfigArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    with_operations(global, |ops| ops.backup_db(&args.config))
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    let params = parse_params(&args.params)?;
    with_operations(global, |ops| ops.run_task(&args.config, &args.task, params))
}
