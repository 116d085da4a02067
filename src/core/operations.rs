//! Top-level operations: one user-facing command each, expressed as
//! orchestrated tasks against a named configuration.

use crate::config::{Configuration, ConfigurationProvider};
use crate::error::{Error, Result};
use crate::executor::{HostTarget, RemoteExecutor, SshExecutor};
use crate::method::{default_base_name, MethodRegistry, TaskArgs};
use crate::orchestrator::TaskOrchestrator;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;

// ============================================================================
// Outputs
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub project: String,
    pub config_name: String,
    pub task: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionOutput {
    pub project: String,
    pub config_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOutput {
    pub project: String,
    pub config_name: String,
    pub source: String,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOutput {
    pub project: String,
    pub configurations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyOutput {
    pub config_name: String,
    pub property: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutOutput {
    pub project: String,
    pub config_name: String,
    pub needs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<HostTarget>,
    pub configuration: Configuration,
}

// ============================================================================
// Operations
// ============================================================================

/// Binds a configuration provider to an orchestrator for one run.
pub struct Operations<'p> {
    provider: &'p dyn ConfigurationProvider,
    orchestrator: TaskOrchestrator,
}

impl<'p> Operations<'p> {
    pub fn new(
        provider: &'p dyn ConfigurationProvider,
        registry: MethodRegistry,
        executor: Rc<dyn RemoteExecutor>,
    ) -> Self {
        let orchestrator = TaskOrchestrator::new(registry, executor, provider.settings().clone());
        Self {
            provider,
            orchestrator,
        }
    }

    /// Built-in methods over SSH.
    pub fn with_defaults(provider: &'p dyn ConfigurationProvider) -> Self {
        Self::new(provider, MethodRegistry::with_defaults(), Rc::new(SshExecutor::new()))
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    fn project(&self) -> String {
        self.provider.settings().name()
    }

    fn configuration(&self, name: &str) -> Result<Configuration> {
        self.provider.configuration(name)
    }

    fn run(&self, config: &Configuration, task: &str, mut args: TaskArgs) -> Result<TaskOutput> {
        self.orchestrator.run_task(config, task, &mut args)?;
        Ok(TaskOutput {
            project: self.project(),
            config_name: config.name().to_string(),
            task: task.to_string(),
            results: args.results,
        })
    }

    fn call(
        &self,
        config: &Configuration,
        method: &str,
        task: &str,
        mut args: TaskArgs,
    ) -> Result<TaskOutput> {
        self.orchestrator.call(method, task, config, &mut args)?;
        Ok(TaskOutput {
            project: self.project(),
            config_name: config.name().to_string(),
            task: task.to_string(),
            results: args.results,
        })
    }

    pub fn reset(&self, name: &str, with_password_reset: bool) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        log_status!("reset", "Resetting {}@{}", self.project(), config.name());
        let args = TaskArgs::new().with_param("withPasswordReset", flag(with_password_reset));
        self.run(&config, "reset", args)
    }

    /// Deploy the configured branch; `reset` runs chained before
    /// `deployFinished` unless disabled.
    pub fn deploy(&self, name: &str, reset_afterwards: bool) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        log_status!(
            "deploy",
            "Deploying branch {} to {}@{}",
            config.string("branch").unwrap_or_default(),
            self.project(),
            config.name()
        );
        let mut args = TaskArgs::new().with_param("baseName", default_base_name(&config));
        if reset_afterwards {
            args = args.with_next_tasks(["reset"]);
        }
        self.run(&config, "deploy", args)
    }

    pub fn backup(&self, name: &str, with_files: bool) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        if !config.flag("supportsBackups", true) {
            log_status!("backup", "{} does not support backups", config.name());
            return Ok(TaskOutput {
                project: self.project(),
                config_name: config.name().to_string(),
                task: "backup".to_string(),
                results: BTreeMap::new(),
            });
        }
        log_status!("backup", "Backing up {}@{}", self.project(), config.name());
        let args = TaskArgs::new()
            .with_param("baseName", default_base_name(&config))
            .with_param("withFiles", flag(with_files));
        self.run(&config, "backup", args)
    }

    pub fn backup_db(&self, name: &str) -> Result<TaskOutput> {
        self.backup(name, false)
    }

    pub fn version(&self, name: &str) -> Result<VersionOutput> {
        let config = self.configuration(name)?;
        let output = self.call(&config, "git", "getVersion", TaskArgs::new())?;
        let version = output.results.get("version").cloned().unwrap_or_default();
        log_status!(
            "version",
            "{} @ {} tagged with: {}",
            output.project,
            output.config_name,
            version
        );
        Ok(VersionOutput {
            project: output.project,
            config_name: output.config_name,
            version,
        })
    }

    /// Copy database and/or files from `source`, then reset with a password
    /// reset when the database was copied.
    pub fn copy_from(
        &self,
        name: &str,
        source: &str,
        copy_db: bool,
        copy_files: bool,
    ) -> Result<CopyOutput> {
        let config = self.configuration(name)?;
        let source_config = self.configuration(source)?;
        let mut steps = Vec::new();

        if copy_db {
            let args = TaskArgs::new().with_source(source_config.clone());
            self.run(&config, "copyDBFrom", args)?;
            steps.push("copyDBFrom".to_string());
        }
        if copy_files {
            let args = TaskArgs::new().with_source(source_config.clone());
            self.run(&config, "copyFilesFrom", args)?;
            steps.push("copyFilesFrom".to_string());
        }
        if copy_db {
            let args = TaskArgs::new().with_param("withPasswordReset", "1");
            self.run(&config, "reset", args)?;
            steps.push("reset".to_string());
        }

        Ok(CopyOutput {
            project: self.project(),
            config_name: config.name().to_string(),
            source: source_config.name().to_string(),
            steps,
        })
    }

    pub fn copy_db_from(&self, name: &str, source: &str) -> Result<CopyOutput> {
        self.copy_from(name, source, true, false)
    }

    pub fn copy_files_from(&self, name: &str, source: &str) -> Result<CopyOutput> {
        self.copy_from(name, source, false, true)
    }

    /// Run a docker subtask; extra parameters become `%key%` replacements.
    pub fn docker(
        &self,
        name: &str,
        subtask: &str,
        params: BTreeMap<String, String>,
    ) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let mut args = TaskArgs::new();
        args.params = params;
        let args = args.with_param("subtask", subtask);
        self.call(&config, "docker", "docker", args)
    }

    pub fn drush(&self, name: &str, command: &str) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let args = TaskArgs::new().with_param("command", command);
        self.call(&config, "drush", "drush", args)
    }

    pub fn drupalconsole(&self, name: &str, command: &str) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let args = TaskArgs::new().with_param("command", command);
        self.call(&config, "drupalconsole", "drupalconsole", args)
    }

    pub fn composer(&self, name: &str, command: &str) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let args = TaskArgs::new().with_param("command", command);
        self.call(&config, "composer", "composer", args)
    }

    pub fn notify(&self, name: &str, message: &str) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let args = TaskArgs::new().with_param("message", message);
        self.call(&config, "slack", "notify", args)
    }

    pub fn script(
        &self,
        name: &str,
        script: &str,
        params: BTreeMap<String, String>,
    ) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let mut args = TaskArgs::new();
        args.params = params;
        let args = args.with_param("script", script);
        self.call(&config, "script", "script", args)
    }

    /// Run any task through the full protocol.
    pub fn run_task(
        &self,
        name: &str,
        task: &str,
        params: BTreeMap<String, String>,
    ) -> Result<TaskOutput> {
        let config = self.configuration(name)?;
        let mut args = TaskArgs::new();
        args.params = params;
        self.run(&config, task, args)
    }

    pub fn list(&self) -> ListOutput {
        ListOutput {
            project: self.project(),
            configurations: self.provider.names(),
        }
    }

    pub fn get_property(&self, name: &str, property: &str) -> Result<PropertyOutput> {
        let config = self.configuration(name)?;
        let value = config
            .property(property)
            .cloned()
            .ok_or_else(|| Error::config_missing_key(property, Some(config.name().to_string())))?;
        Ok(PropertyOutput {
            config_name: config.name().to_string(),
            property: property.to_string(),
            value,
        })
    }

    pub fn about(&self, name: &str) -> Result<AboutOutput> {
        let config = self.configuration(name)?;
        Ok(AboutOutput {
            project: self.project(),
            config_name: config.name().to_string(),
            needs: config.needs(),
            target: self.orchestrator.target(&config).ok(),
            configuration: config,
        })
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}
