//! Three-phase task dispatch across the methods an environment needs.

use crate::config::{Configuration, Settings};
use crate::error::Result;
use crate::executor::{HostTarget, RemoteExecutor};
use crate::method::{
    HookContext, MethodRegistry, Requirement, TaskArgs, POSTFLIGHT, PREFLIGHT,
};
use std::rc::Rc;

/// Drives `preflight`, `<task>Prepare`, `<task>`, chained tasks,
/// `<task>Finished` and `postflight` over the `needs` list of a configuration.
pub struct TaskOrchestrator {
    registry: MethodRegistry,
    executor: Rc<dyn RemoteExecutor>,
    settings: Settings,
}

impl TaskOrchestrator {
    pub fn new(registry: MethodRegistry, executor: Rc<dyn RemoteExecutor>, settings: Settings) -> Self {
        Self {
            registry,
            executor,
            settings,
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &dyn RemoteExecutor {
        self.executor.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Login for `config`, honouring tunnels.
    pub fn target(&self, config: &Configuration) -> Result<HostTarget> {
        HostTarget::for_configuration(config)
    }

    /// Run `task` through the full protocol.
    ///
    /// Tasks queued in `args.next_tasks` run, front first, between this task's
    /// main phase and its `Finished` phase, each through the full protocol.
    pub fn run_task(&self, config: &Configuration, task: &str, args: &mut TaskArgs) -> Result<()> {
        self.flight(PREFLIGHT, task, config, args)?;
        self.phase(&format!("{}Prepare", task), task, config, args)?;
        self.phase(task, task, config, args)?;

        if let Some(next) = args.next_tasks.pop_front() {
            self.run_task(config, &next, args)?;
        }

        self.phase(&format!("{}Finished", task), task, config, args)?;
        self.flight(POSTFLIGHT, task, config, args)
    }

    /// Run one mandatory hook on one method, bracketed by preflight and
    /// postflight on every needed method.
    pub fn call(
        &self,
        method: &str,
        task: &str,
        config: &Configuration,
        args: &mut TaskArgs,
    ) -> Result<()> {
        self.flight(PREFLIGHT, task, config, args)?;
        let ctx = self.context(task, task, config);
        self.registry
            .call(method, &ctx, args, Requirement::Mandatory)?;
        self.flight(POSTFLIGHT, task, config, args)
    }

    fn context<'a>(&'a self, hook: &'a str, task: &'a str, config: &'a Configuration) -> HookContext<'a> {
        HookContext {
            hook,
            task,
            config,
            orchestrator: self,
        }
    }

    fn flight(&self, hook: &str, task: &str, config: &Configuration, args: &mut TaskArgs) -> Result<()> {
        let ctx = self.context(hook, task, config);
        for method in config.needs() {
            self.registry.call(&method, &ctx, args, Requirement::Optional)?;
        }
        Ok(())
    }

    fn phase(&self, hook: &str, task: &str, config: &Configuration, args: &mut TaskArgs) -> Result<()> {
        let ctx = self.context(hook, task, config);
        let mut announced = false;
        for name in config.needs() {
            let method = self.registry.get(&name)?;
            if !method.has_hook(hook) {
                continue;
            }
            if !announced {
                log_status!("task", "Running task {} on configuration {}", hook, config.name());
                announced = true;
            }
            self.registry.call(&name, &ctx, args, Requirement::Optional)?;
        }
        Ok(())
    }
}
