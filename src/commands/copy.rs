use clap::Args;

use fabalicious::operations::CopyOutput;

use super::{with_operations, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct CopyFromArgs {
    /// Configuration to copy into
    pub config: String,

    /// Configuration to copy from
    pub from: String,

    /// Skip the database
    #[arg(long)]
    pub skip_db: bool,

    /// Skip the file folders
    #[arg(long)]
    pub skip_files: bool,
}

#[derive(Args)]
pub struct CopyArgs {
    /// Configuration to copy into
    pub config: String,

    /// Configuration to copy from
    pub from: String,
}

pub fn copy_from(args: CopyFromArgs, global: &GlobalArgs) -> CmdResult<CopyOutput> {
    with_operations(global, |ops| {
        ops.copy_from(&args.config, &args.from, !args.skip_db, !args.skip_files)
    })
}

pub fn copy_db_from(args: CopyArgs, global: &GlobalArgs) -> CmdResult<CopyOutput> {
    with_operations(global, |ops| ops.copy_db_from(&args.config, &args.from))
}

pub fn copy_files_from(args: CopyArgs, global: &GlobalArgs) -> CmdResult<CopyOutput> {
    with_operations(global, |ops| ops.copy_files_from(&args.config, &args.from))
}
