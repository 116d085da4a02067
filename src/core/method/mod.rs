//! Pluggable methods and the hook dispatch contract.
//!
//! A method is a named capability (version control, database tool, tunnel,
//! docker, notification, ...) that implements a subset of the orchestration
//! hooks. Each method publishes an explicit capability table mapping hook names
//! (`preflight`, `reset`, `deployPrepare`, ...) to functions; a hook absent from
//! the table is skipped by the orchestrator.

pub mod composer;
pub mod docker;
pub mod drupalconsole;
pub mod drush;
pub mod files;
pub mod git;
pub mod registry;
pub mod script;
pub mod slack;
pub mod ssh;

pub use registry::{MethodFactory, MethodRegistry};

use crate::config::{Configuration, Settings};
use crate::error::Result;
use crate::executor::{CommandOutput, CommandRequest, HostTarget};
use crate::orchestrator::TaskOrchestrator;
use std::collections::{BTreeMap, VecDeque};

/// Hooks run around every dispatched task.
pub const PREFLIGHT: &str = "preflight";
pub const POSTFLIGHT: &str = "postflight";

/// Whether a dispatched hook must exist on the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Mandatory,
    Optional,
}

/// Call-time arguments threaded through one orchestrated task.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    /// Keyword arguments, e.g. `command` for `drush` or `subtask` for `docker`.
    pub params: BTreeMap<String, String>,
    pub positional: Vec<String>,
    /// Tasks chained after the current one, consumed from the front.
    pub next_tasks: VecDeque<String>,
    /// The environment copied from by `copyDBFrom` / `copyFilesFrom`.
    pub source_config: Option<Configuration>,
    /// Values written back by hooks, e.g. `ip` or `version`.
    pub results: BTreeMap<String, String>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_positional(mut self, values: Vec<String>) -> Self {
        self.positional = values;
        self
    }

    pub fn with_next_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: Configuration) -> Self {
        self.source_config = Some(source);
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Boolean keyword argument; accepts `1/true/yes` and `0/false/no`.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.param(key).map(str::to_ascii_lowercase).as_deref() {
            Some("1" | "true" | "yes") => true,
            Some("0" | "false" | "no") => false,
            _ => default,
        }
    }

    pub fn result(&self, key: &str) -> Option<&str> {
        self.results.get(key).map(String::as_str)
    }

    pub fn set_result(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.results.insert(key.into(), value.into());
    }
}

/// What a hook sees of the current dispatch.
pub struct HookContext<'a> {
    /// The hook being invoked, e.g. `resetPrepare` or `preflight`.
    pub hook: &'a str,
    /// The orchestrated task; for `preflight`/`postflight` the upcoming task.
    pub task: &'a str,
    pub config: &'a Configuration,
    pub orchestrator: &'a TaskOrchestrator,
}

impl HookContext<'_> {
    /// Login of the configuration being operated on.
    pub fn target(&self) -> Result<HostTarget> {
        self.orchestrator.target(self.config)
    }

    /// Run a command on the configuration's host.
    pub fn run(&self, request: CommandRequest) -> Result<CommandOutput> {
        self.orchestrator.executor().run(&self.target()?, &request)
    }

    pub fn settings(&self) -> &Settings {
        self.orchestrator.settings()
    }
}

/// `<backupFolder>/<baseName>` without extension. `baseName` defaults to
/// `<config>--<timestamp>`; `git` prefixes the deployed version during
/// `backupPrepare`.
pub fn backup_base_path(config: &Configuration, args: &TaskArgs) -> String {
    let folder = config
        .string("backupFolder")
        .unwrap_or_else(|| "/var/www/backups".to_string());
    let base = args
        .param("baseName")
        .map(str::to_string)
        .unwrap_or_else(|| default_base_name(config));
    format!("{}/{}", folder.trim_end_matches('/'), base)
}

pub fn default_base_name(config: &Configuration) -> String {
    format!(
        "{}--{}",
        config.name(),
        chrono::Local::now().format("%Y-%m-%d--%H-%M-%S")
    )
}

/// A hook implementation on method type `M`.
pub type Hook<M> = fn(&M, &HookContext<'_>, &mut TaskArgs) -> Result<()>;

/// Hook name to implementation table, built when the method is constructed.
pub struct Capabilities<M> {
    hooks: BTreeMap<&'static str, Hook<M>>,
}

impl<M> Default for Capabilities<M> {
    fn default() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }
}

impl<M> Capabilities<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: &'static str, implementation: Hook<M>) -> Self {
        self.hooks.insert(hook, implementation);
        self
    }

    pub fn get(&self, hook: &str) -> Option<Hook<M>> {
        self.hooks.get(hook).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.keys().copied().collect()
    }
}

/// Object-safe view of a method used by the registry and orchestrator.
pub trait Method {
    fn name(&self) -> &str;
    fn has_hook(&self, hook: &str) -> bool;
    fn hooks(&self) -> Vec<&'static str>;
    /// Run `ctx.hook`, or `None` when the method does not implement it.
    fn invoke(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Option<Result<()>>;
}

/// Implemented by concrete methods; `Method` follows from the capability table.
pub trait HookProvider: Sized {
    fn method_name(&self) -> &str;
    fn capabilities(&self) -> &Capabilities<Self>;
}

impl<M: HookProvider> Method for M {
    fn name(&self) -> &str {
        self.method_name()
    }

    fn has_hook(&self, hook: &str) -> bool {
        self.capabilities().get(hook).is_some()
    }

    fn hooks(&self) -> Vec<&'static str> {
        self.capabilities().names()
    }

    fn invoke(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Option<Result<()>> {
        let hook = self.capabilities().get(ctx.hook)?;
        Some(hook(self, ctx, args))
    }
}
