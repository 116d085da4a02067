use clap::Args;

use fabalicious::operations::{AboutOutput, ListOutput, PropertyOutput, VersionOutput};

use super::tasks::ConfigArgs;
use super::{with_operations, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct PropertyArgs {
    /// Configuration name
    pub config: String,

    /// Slash-separated path, e.g. docker/name
    pub property: String,
}

pub fn version(args: ConfigArgs, global: &GlobalArgs) -> CmdResult<VersionOutput> {
    with_operations(global, |ops| ops.version(&args.config))
}

pub fn list(_args: (), global: &GlobalArgs) -> CmdResult<ListOutput> {
    with_operations(global, |ops| Ok(ops.list()))
}

pub fn get_property(args: PropertyArgs, global: &GlobalArgs) -> CmdResult<PropertyOutput> {
    with_operations(global, |ops| ops.get_property(&args.config, &args.property))
}

pub fn about(args: ConfigArgs, global: &GlobalArgs) -> CmdResult<AboutOutput> {
    with_operations(global, |ops| ops.about(&args.config))
}
