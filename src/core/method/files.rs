//! Public and private file folders: tarball backups and rsync copies between
//! environments.

use super::{backup_base_path, Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::{scalar_to_string, Settings};
use crate::error::{Error, Result};
use crate::executor::{CommandRequest, HostTarget};
use crate::shell;
use serde_json::Value;

/// Folder keys copied and backed up, with the tarball suffix of each.
const FOLDERS: &[(&str, &str)] = &[("filesFolder", ""), ("privateFilesFolder", "_private")];

pub struct FilesMethod {
    capabilities: Capabilities<Self>,
}

impl Default for FilesMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("backup", Self::backup)
                .with("copyFilesFrom", Self::copy_files_from),
        }
    }

    fn backup(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let config = ctx.config;
        if !config.flag("supportsBackups", true) {
            return Ok(());
        }
        if !args.flag("withFiles", true) {
            log_status!("files", "Backup of files skipped per request");
            return Ok(());
        }

        let base = backup_base_path(config, args);
        let excludes = exclude_options(ctx.settings(), "backup", "--exclude=");
        for (key, suffix) in FOLDERS {
            let Some(folder) = config.string(key) else {
                continue;
            };
            let archive = format!("{}{}.tgz", base, suffix);
            log_status!("files", "Backing up {} to {}", folder, archive);
            ctx.run(
                CommandRequest::new(tar_command(&excludes, &archive))
                    .in_dir(folder)
                    .tolerant(),
            )?;
            args.set_result(format!("{}Backup", key), archive);
        }
        Ok(())
    }

    fn copy_files_from(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let config = ctx.config;
        let source = args
            .source_config
            .as_ref()
            .ok_or_else(|| Error::validation_missing_argument(vec!["from".to_string()]))?;

        if !config.flag("supportsCopyFrom", true) {
            log_status!(
                "files",
                "The configuration '{}' does not support copyFrom",
                config.name()
            );
            return Ok(());
        }
        log_status!("files", "Copying files from {} to {}", source.name(), config.name());

        let source_target = HostTarget::for_configuration(source)?;
        let folder = config.require_string("rootFolder")?;
        let excludes = exclude_options(ctx.settings(), "copyFrom", "--exclude ");

        for (key, _) in FOLDERS {
            let (Some(from), Some(to)) = (source.string(key), config.string(key)) else {
                continue;
            };
            let command = rsync_command(&source_target, &excludes, &from, &to);
            ctx.run(CommandRequest::new(command).in_dir(&folder).tolerant())?;
        }
        Ok(())
    }
}

fn exclude_options(settings: &Settings, key: &str, flag: &str) -> String {
    settings
        .get("excludeFiles")
        .and_then(|excludes| excludes.get(key))
        .and_then(Value::as_array)
        .map(|patterns| {
            patterns
                .iter()
                .filter_map(scalar_to_string)
                .map(|pattern| format!("{}\"{}\"", flag, pattern))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn tar_command(excludes: &str, archive: &str) -> String {
    if excludes.is_empty() {
        format!("tar -czPf {} *", archive)
    } else {
        format!("tar {} -czPf {} *", excludes, archive)
    }
}

/// rsync pulling `from` on the source host into the local `to` folder.
pub fn rsync_command(source: &HostTarget, excludes: &str, from: &str, to: &str) -> String {
    let mut ssh = vec![
        "ssh".to_string(),
        "-T".to_string(),
        "-o".to_string(),
        "Compression=no".to_string(),
    ];
    if !source.strict_host_key_checking {
        ssh.extend(shell::no_strict_host_key_checking_args());
    }
    ssh.push("-p".to_string());
    ssh.push(source.port.to_string());

    let mut parts = vec![
        "rsync -rav --no-o --no-g".to_string(),
        format!("-e \"{}\"", ssh.join(" ")),
    ];
    if !excludes.is_empty() {
        parts.push(excludes.to_string());
    }
    parts.push(format!(
        "{}@{}:{}/*",
        source.user,
        source.host,
        from.trim_end_matches('/')
    ));
    parts.push(to.to_string());
    parts.join(" ")
}

impl HookProvider for FilesMethod {
    fn method_name(&self) -> &str {
        "files"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
