//! Drupal site maintenance through drush: reset, SQL dumps and database copies.

use super::{backup_base_path, Capabilities, HookContext, HookProvider, TaskArgs};
use crate::config::{scalar_to_string, Configuration, Settings};
use crate::error::{Error, Result};
use crate::executor::{CommandRequest, HostTarget, RemoteExecutor};
use crate::shell;
use serde_json::Value;

pub struct DrushMethod {
    capabilities: Capabilities<Self>,
}

impl Default for DrushMethod {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands bound to one host and folder.
struct Session<'a> {
    executor: &'a dyn RemoteExecutor,
    target: HostTarget,
    folder: String,
}

impl Session<'_> {
    fn run(&self, command: impl Into<String>) -> Result<()> {
        let request = CommandRequest::new(command).in_dir(&self.folder);
        self.executor.run(&self.target, &request).map(|_| ())
    }

    fn run_tolerant(&self, command: impl Into<String>) -> Result<()> {
        let request = CommandRequest::new(command)
            .in_dir(&self.folder)
            .tolerant();
        self.executor.run(&self.target, &request).map(|_| ())
    }
}

impl DrushMethod {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("reset", Self::reset)
                .with("backup", Self::backup)
                .with("deployPrepare", Self::deploy_prepare)
                .with("drush", Self::drush)
                .with("copyDBFrom", Self::copy_db_from),
        }
    }

    fn reset(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let config = ctx.config;
        let session = site_session(ctx, config, ctx.target()?)?;
        let development = config.flag("useForDevelopment", false);

        if development {
            if args.flag("withPasswordReset", false) {
                session.run("drush user-password admin --password=\"admin\"")?;
            }
            if let Some(files) = config.string("filesFolder") {
                session.run_tolerant(format!("chmod -R 777 {}", files))?;
            }
        }
        if let Some(module) = ctx.settings().string("deploymentModule") {
            session.run_tolerant(format!("drush en -y {}", module))?;
        }
        session.run("drush updb -y")?;
        session.run_tolerant("drush fra -y")?;

        for command in common_commands(ctx.settings(), development) {
            session.run_tolerant(command)?;
        }
        session.run_tolerant("drush cc all")
    }

    fn backup(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        if !ctx.config.flag("supportsBackups", true) {
            return Ok(());
        }
        let file = format!("{}.sql", backup_base_path(ctx.config, args));
        log_status!("drush", "Backing up database of {} to {}", ctx.config.name(), file);
        let session = site_session(ctx, ctx.config, ctx.target()?)?;
        let dumped = backup_sql(&session, ctx.config, ctx.settings(), &file)?;
        args.set_result("sqlBackup", dumped);
        Ok(())
    }

    fn deploy_prepare(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        if ctx.config.flag("useForDevelopment", false) {
            return Ok(());
        }
        self.backup(ctx, args)
    }

    fn drush(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let command = command_argument(args)?;
        let session = site_session(ctx, ctx.config, ctx.target()?)?;
        session.run(format!("drush {}", command))
    }

    fn copy_db_from(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> Result<()> {
        let config = ctx.config;
        let source = args
            .source_config
            .as_ref()
            .ok_or_else(|| Error::validation_missing_argument(vec!["from".to_string()]))?;

        if !config.flag("supportsCopyFrom", true) {
            log_status!(
                "drush",
                "The configuration '{}' does not support copyFrom",
                config.name()
            );
            return Ok(());
        }
        log_status!("drush", "Copying database from {} to {}", source.name(), config.name());

        let zipped = source.flag("supportsZippedBackups", true);
        let source_target = HostTarget::for_configuration(source)?;
        let mut source_file = format!("{}/{}.sql", tmp_folder(source), source.name());
        let mut target_file = format!("{}/{}_target.sql", tmp_folder(config), source.name());
        if zipped {
            target_file.push_str(".gz");
        }

        let source_session = site_session(ctx, source, source_target.clone())?;
        source_file = backup_sql(&source_session, source, ctx.settings(), &source_file)?;

        let login = login_args(&source_target);
        let session = site_session(ctx, config, ctx.target()?)?;
        session.run(format!(
            "scp -P {} {}:{} {} >>/dev/null",
            source_target.port, login, source_file, target_file
        ))?;
        session.run(format!(
            "ssh -p {} {} rm {}",
            source_target.port, login, source_file
        ))?;

        if zipped {
            session.run(format!("zcat {} | $(drush sql-connect)", target_file))?;
        } else {
            session.run(format!("drush sql-cli < {}", target_file))?;
        }
        session.run_tolerant(format!("rm {}", target_file))
    }
}

fn site_session<'a>(
    ctx: &HookContext<'a>,
    config: &Configuration,
    target: HostTarget,
) -> Result<Session<'a>> {
    Ok(Session {
        executor: ctx.orchestrator.executor(),
        target,
        folder: config.require_string("siteFolder")?,
    })
}

fn tmp_folder(config: &Configuration) -> String {
    config
        .string("tmpFolder")
        .unwrap_or_else(|| "/tmp".to_string())
        .trim_end_matches('/')
        .to_string()
}

fn login_args(target: &HostTarget) -> String {
    let login = format!("{}@{}", target.user, target.host);
    if target.strict_host_key_checking {
        login
    } else {
        format!("{} {}", shell::no_strict_host_key_checking_args().join(" "), login)
    }
}

/// `command` keyword, or the positional arguments joined.
pub(crate) fn command_argument(args: &TaskArgs) -> Result<String> {
    let command = match args.param("command") {
        Some(command) => command.to_string(),
        None => args.positional.join(" "),
    };
    if command.trim().is_empty() {
        return Err(Error::validation_missing_argument(vec!["command".to_string()]));
    }
    Ok(command)
}

fn common_commands(settings: &Settings, development: bool) -> Vec<String> {
    let key = if development { "development" } else { "deployment" };
    settings
        .get("common")
        .and_then(|common| common.get(key))
        .and_then(Value::as_array)
        .map(|lines| lines.iter().filter_map(scalar_to_string).collect())
        .unwrap_or_default()
}

/// Dump the database of `config` into `file`; returns the written file name.
fn backup_sql(
    session: &Session<'_>,
    config: &Configuration,
    settings: &Settings,
    file: &str,
) -> Result<String> {
    let mut options = Vec::new();
    if let Some(tables) = settings.lines("sqlSkipTables").filter(|t| !t.is_empty()) {
        options.push(format!("--structure-tables-list={}", tables.join(",")));
    }

    if let Some((folder, _)) = file.rsplit_once('/') {
        if !folder.is_empty() {
            session.run_tolerant(format!("mkdir -p {}", folder))?;
        }
    }
    session.run_tolerant(format!("rm -f {}", file))?;

    let zipped = config.flag("supportsZippedBackups", true);
    if zipped {
        session.run_tolerant(format!("rm -f {}.gz", file))?;
        options.push("--gzip".to_string());
    }
    options.push(format!("--result-file={}", file));

    session.run(format!("drush sql-dump {}", options.join(" ")))?;
    Ok(if zipped {
        format!("{}.gz", file)
    } else {
        file.to_string()
    })
}

impl HookProvider for DrushMethod {
    fn method_name(&self) -> &str {
        "drush"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{failing, RecordingExecutor};
    use crate::method::{MethodFactory, MethodRegistry};
    use crate::orchestrator::TaskOrchestrator;
    use crate::ErrorCode;
    use std::rc::Rc;

    fn settings() -> Settings {
        match serde_json::json!({
            "deploymentModule": "site_deploy",
            "sqlSkipTables": ["cache", "watchdog"],
            "common": {
                "development": ["drush vset preprocess_css 0"],
                "deployment": ["drush vset preprocess_css 1"]
            }
        }) {
            Value::Object(map) => Settings::from_map(map),
            _ => unreachable!(),
        }
    }

    fn setup(executor: Rc<RecordingExecutor>) -> TaskOrchestrator {
        let mut registry = MethodRegistry::new();
        registry.register(MethodFactory::named("drush", || Rc::new(DrushMethod::new())));
        TaskOrchestrator::new(registry, executor, settings())
    }

    fn local() -> Configuration {
        Configuration::new("local", &["drush"])
            .with("user", "dev")
            .with("host", "local.example.com")
            .with("siteFolder", "/var/www/web")
            .with("filesFolder", "/var/www/web/sites/default/files")
            .with("backupFolder", "/backups")
            .with("tmpFolder", "/tmp")
            .with("useForDevelopment", true)
    }

    fn live() -> Configuration {
        Configuration::new("live", &["drush"])
            .with("user", "www")
            .with("host", "live.example.com")
            .with("port", 2200)
            .with("siteFolder", "/srv/web")
            .with("tmpFolder", "/tmp/")
    }

    #[test]
    fn development_reset_runs_full_sequence() {
        let executor = Rc::new(RecordingExecutor::new());
        let orchestrator = setup(executor.clone());
        let mut args = TaskArgs::new().with_param("withPasswordReset", "1");
        orchestrator.run_task(&local(), "reset", &mut args).unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "drush user-password admin --password=\"admin\"",
                "chmod -R 777 /var/www/web/sites/default/files",
                "drush en -y site_deploy",
                "drush updb -y",
                "drush fra -y",
                "drush vset preprocess_css 0",
                "drush cc all",
            ]
        );
    }

    #[test]
    fn failed_update_aborts_reset() {
        let executor = Rc::new(RecordingExecutor::new());
        executor.respond("drush updb -y", failing(1));
        executor.respond("drush fra -y", failing(1));
        let orchestrator = setup(executor.clone());

        let err = orchestrator
            .run_task(&live(), "reset", &mut TaskArgs::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(executor.commands().last().map(String::as_str), Some("drush updb -y"));
    }

    #[test]
    fn backup_dumps_gzipped_sql_skipping_tables() {
        let executor = Rc::new(RecordingExecutor::new());
        let orchestrator = setup(executor.clone());
        let mut args = TaskArgs::new().with_param("baseName", "local--now");
        orchestrator.run_task(&local(), "backup", &mut args).unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "mkdir -p /backups",
                "rm -f /backups/local--now.sql",
                "rm -f /backups/local--now.sql.gz",
                "drush sql-dump --structure-tables-list=cache,watchdog --gzip --result-file=/backups/local--now.sql",
            ]
        );
        assert_eq!(args.result("sqlBackup"), Some("/backups/local--now.sql.gz"));
    }

    #[test]
    fn deploy_prepare_backs_up_only_non_development() {
        let executor = Rc::new(RecordingExecutor::new());
        let orchestrator = setup(executor.clone());
        orchestrator
            .run_task(&local(), "deploy", &mut TaskArgs::new())
            .unwrap();
        assert!(executor.commands().is_empty());

        orchestrator
            .run_task(&live(), "deploy", &mut TaskArgs::new())
            .unwrap();
        assert!(executor
            .commands()
            .iter()
            .any(|c| c.starts_with("drush sql-dump")));
    }

    #[test]
    fn copy_db_dumps_on_source_and_imports_on_target() {
        let executor = Rc::new(RecordingExecutor::new());
        let orchestrator = setup(executor.clone());
        let mut args = TaskArgs::new().with_source(live());
        orchestrator
            .run_task(&local(), "copyDBFrom", &mut args)
            .unwrap();

        let calls = executor.calls.borrow();
        let hosts: Vec<&str> = calls.iter().map(|(t, _)| t.host.as_str()).collect();
        assert_eq!(&hosts[..4], &["live.example.com"; 4]);
        assert!(hosts[4..].iter().all(|h| *h == "local.example.com"));
        drop(calls);

        let commands = executor.commands();
        assert_eq!(
            &commands[4..],
            &[
                "scp -P 2200 www@live.example.com:/tmp/live.sql.gz /tmp/live_target.sql.gz >>/dev/null",
                "ssh -p 2200 www@live.example.com rm /tmp/live.sql.gz",
                "zcat /tmp/live_target.sql.gz | $(drush sql-connect)",
                "rm /tmp/live_target.sql.gz",
            ]
        );
    }

    #[test]
    fn drush_command_needs_a_command() {
        let executor = Rc::new(RecordingExecutor::new());
        let orchestrator = setup(executor.clone());

        let err = orchestrator
            .call("drush", "drush", &local(), &mut TaskArgs::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationMissingArgument);

        let mut args = TaskArgs::new().with_param("command", "cr");
        orchestrator.call("drush", "drush", &local(), &mut args).unwrap();
        assert_eq!(executor.commands(), vec!["drush cr"]);
    }
}
