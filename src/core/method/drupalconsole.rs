use super::drush::command_argument;
use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::error::Result;
use crate::executor::CommandRequest;

const INSTALLER_URL: &str = "https://drupalconsole.com/installer";
const INSTALL_PATH: &str = "/usr/local/bin/drupal";

/// Drupal Console: `install` fetches the phar, anything else runs `drupal <command>`.
pub struct DrupalConsoleMethod {
    capabilities: Capabilities<Self>,
}

impl Default for DrupalConsoleMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl DrupalConsoleMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new().with("drupalconsole", Self::drupalconsole),
        }
    }

    fn drupalconsole(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let command = command_argument(args)?;
        if command == "install" {
            return install(ctx);
        }
        let folder = ctx.config.require_string("siteFolder")?;
        ctx.run(CommandRequest::new(format!("drupal {}", command)).in_dir(folder))?;
        Ok(())
    }
}

fn install(ctx: &HookContext<'_>) -> Result<()> {
    let folder = ctx
        .config
        .string("tmpFolder")
        .unwrap_or_else(|| "/tmp".to_string());
    for command in [
        format!("curl {} -L -o drupal.phar", INSTALLER_URL),
        format!("mv drupal.phar {}", INSTALL_PATH),
        format!("chmod +x {}", INSTALL_PATH),
    ] {
        ctx.run(CommandRequest::new(command).in_dir(&folder))?;
    }
    log_status!("drupalconsole", "Drupal Console installed successfully");
    Ok(())
}

impl HookProvider for DrupalConsoleMethod {
    fn method_name(&self) -> &str {
        "drupalconsole"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}
