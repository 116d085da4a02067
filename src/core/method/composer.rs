use super::drush::command_argument;
use super::{Capabilities, HookContext, HookProvider, TaskArgs};
use crate::error::{Error, Result};
use crate::executor::CommandRequest;

/// Installs PHP dependencies after a deploy and runs ad-hoc composer commands.
pub struct ComposerMethod {
    capabilities: Capabilities<Self>,
}

impl Default for ComposerMethod {
    fn default() -> Self {
        Self::new()
    }
}

impl ComposerMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("deploy", Self::deploy)
                .with("composer", Self::composer),
        }
    }

    fn deploy(&self, ctx: &HookContext<'_>, _args: &mut TaskArgs) -> Result<()> {
        self.run_composer(ctx, "install")
    }

    fn composer(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let command = command_argument(args)?;
        self.run_composer(ctx, &command)
    }

    fn run_composer(&self, ctx: &HookContext<'_>, command: &str) -> Result<()> {
        let folder = ctx
            .config
            .string("composerRootFolder")
            .or_else(|| ctx.config.string("gitRootFolder"))
            .ok_or_else(|| {
                Error::config_missing_key("gitRootFolder", Some(ctx.config.name().to_string()))
            })?;
        ctx.run(CommandRequest::new(format!("composer {}", command)).in_dir(folder))?;
        Ok(())
    }
}

impl HookProvider for ComposerMethod {
    fn method_name(&self) -> &str {
        "composer"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, Settings};
    use crate::executor::testing::RecordingExecutor;
    use crate::method::{MethodFactory, MethodRegistry};
    use crate::orchestrator::TaskOrchestrator;
    use std::rc::Rc;

    #[test]
    fn deploy_installs_in_git_root() {
        let executor = Rc::new(RecordingExecutor::new());
        let mut registry = MethodRegistry::new();
        registry.register(MethodFactory::named("composer", || Rc::new(ComposerMethod::new())));
        let orchestrator = TaskOrchestrator::new(registry, executor.clone(), Settings::default());

        let config = Configuration::new("staging", &["composer"])
            .with("user", "deploy")
            .with("host", "staging.example.com")
            .with("gitRootFolder", "/srv/app");
        orchestrator
            .run_task(&config, "deploy", &mut TaskArgs::new())
            .unwrap();

        let mut args = TaskArgs::new().with_positional(vec!["dump-autoload".into(), "-o".into()]);
        orchestrator
            .call("composer", "composer", &config, &mut args)
            .unwrap();

        assert_eq!(
            executor.commands(),
            vec!["composer install", "composer dump-autoload -o"]
        );
        let calls = executor.calls.borrow();
        assert_eq!(calls[0].1.cwd.as_deref(), Some("/srv/app"));
    }
}
