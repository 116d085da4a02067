use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use fabalicious::method::{Capabilities, HookContext, HookProvider, MethodFactory};
use fabalicious::operations::Operations;
use fabalicious::{
    CommandOutput, CommandRequest, ErrorCode, HostTarget, MethodRegistry, RemoteExecutor,
    TaskArgs, YamlConfigurationProvider,
};

const FABFILE: &str = r#"
name: intranet
needs: [ssh, git, drush]
common:
  development:
    - drush vset preprocess_css 0
hosts:
  local:
    host: localhost
    user: dev
    port: 2222
    branch: develop
    rootFolder: /var/www/intranet
    useForDevelopment: true
    ignoreSubmodules: true
  staging:
    host: staging.example.com
    user: deploy
    branch: main
    rootFolder: /srv/intranet
    gitOptions:
      pull: [--no-edit, --rebase]
"#;

#[derive(Default)]
struct Recorder {
    calls: RefCell<Vec<(HostTarget, CommandRequest)>>,
    responses: RefCell<HashMap<String, CommandOutput>>,
}

impl Recorder {
    fn respond(&self, command: &str, output: CommandOutput) {
        self.responses
            .borrow_mut()
            .insert(command.to_string(), output);
    }

    fn commands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|(_, request)| request.command.clone())
            .collect()
    }
}

impl RemoteExecutor for Recorder {
    fn execute(
        &self,
        target: &HostTarget,
        request: &CommandRequest,
    ) -> fabalicious::Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push((target.clone(), request.clone()));
        let canned = self.responses.borrow().get(&request.command).cloned();
        Ok(canned.unwrap_or(CommandOutput {
            success: true,
            ..CommandOutput::default()
        }))
    }
}

fn provider() -> YamlConfigurationProvider {
    YamlConfigurationProvider::parse(FABFILE, Path::new("fabfile.yaml")).unwrap()
}

#[test]
fn development_deploy_pulls_then_resets() {
    let provider = provider();
    let recorder = Rc::new(Recorder::default());
    let ops = Operations::new(&provider, MethodRegistry::with_defaults(), recorder.clone());

    let output = ops.deploy("local", true).unwrap();

    assert_eq!(output.project, "intranet");
    assert_eq!(
        recorder.commands(),
        vec![
            "git diff --exit-code --quiet",
            "git fetch -q origin",
            "git checkout develop",
            "git fetch --tags",
            "git pull -q origin develop",
            "drush updb -y",
            "drush fra -y",
            "drush vset preprocess_css 0",
            "drush cc all",
        ]
    );

    let calls = recorder.calls.borrow();
    let (target, request) = &calls[0];
    assert_eq!(target.to_string(), "dev@localhost:2222");
    assert_eq!(request.cwd.as_deref(), Some("/var/www/intranet"));
}

#[test]
fn dirty_working_copy_stops_the_deploy() {
    let provider = provider();
    let recorder = Rc::new(Recorder::default());
    recorder.respond(
        "git diff --exit-code --quiet",
        CommandOutput {
            exit_code: 1,
            ..CommandOutput::default()
        },
    );
    let ops = Operations::new(&provider, MethodRegistry::with_defaults(), recorder.clone());

    let err = ops.deploy("staging", true).unwrap_err();

    assert_eq!(err.code, ErrorCode::GitWorkingCopyDirty);
    let commands = recorder.commands();
    assert!(commands.contains(&"git status".to_string()));
    assert!(!commands.iter().any(|c| c.starts_with("git pull")));
    assert!(!commands.contains(&"drush updb -y".to_string()));
}

#[test]
fn production_deploy_dumps_the_database_first() {
    let provider = provider();
    let recorder = Rc::new(Recorder::default());
    let ops = Operations::new(&provider, MethodRegistry::with_defaults(), recorder.clone());

    ops.deploy("staging", false).unwrap();

    let commands = recorder.commands();
    let dump = commands
        .iter()
        .position(|c| c.starts_with("drush sql-dump"))
        .expect("database dump");
    let pull = commands
        .iter()
        .position(|c| c == "git pull -q --no-edit --rebase origin main")
        .expect("pull with options");
    assert!(dump < pull);
    assert!(commands.contains(&"git submodule update --init --recursive".to_string()));
    assert!(!commands.contains(&"drush updb -y".to_string()));
}

#[test]
fn version_reports_the_last_describe_line() {
    let provider = provider();
    let recorder = Rc::new(Recorder::default());
    recorder.respond(
        "git describe --always",
        CommandOutput {
            stdout: "warning: shallow clone\nfeature/login-42-gabc123\n".to_string(),
            success: true,
            ..CommandOutput::default()
        },
    );
    let ops = Operations::new(&provider, MethodRegistry::with_defaults(), recorder);

    let output = ops.version("staging").unwrap();
    assert_eq!(output.version, "feature-login-42-gabc123");
}

#[test]
fn unknown_configuration_is_reported() {
    let provider = provider();
    let ops = Operations::new(
        &provider,
        MethodRegistry::with_defaults(),
        Rc::new(Recorder::default()),
    );

    let err = ops.reset("production", false).unwrap_err();
    assert_eq!(err.code, ErrorCode::ConfigEnvironmentNotFound);
}

struct Audit {
    capabilities: Capabilities<Self>,
    seen: Rc<RefCell<Vec<String>>>,
}

impl Audit {
    fn new(seen: Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            capabilities: Capabilities::new()
                .with("preflight", Self::record)
                .with("resetPrepare", Self::record)
                .with("resetFinished", Self::record),
            seen,
        }
    }

    fn record(&self, ctx: &HookContext<'_>, args: &mut TaskArgs) -> fabalicious::Result<()> {
        self.seen
            .borrow_mut()
            .push(format!("{}:{}", ctx.hook, ctx.config.name()));
        args.set_result("audited", "yes");
        Ok(())
    }
}

impl HookProvider for Audit {
    fn method_name(&self) -> &str {
        "audit"
    }

    fn capabilities(&self) -> &Capabilities<Self> {
        &self.capabilities
    }
}

#[test]
fn custom_methods_join_the_task_protocol() {
    let provider = YamlConfigurationProvider::parse(
        r#"
name: intranet
needs: [audit, drush]
hosts:
  local:
    host: localhost
    user: dev
    rootFolder: /var/www
"#,
        Path::new("fabfile.yaml"),
    )
    .unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut registry = MethodRegistry::with_defaults();
    let shared = seen.clone();
    registry.register(MethodFactory::named("audit", move || {
        Rc::new(Audit::new(shared.clone()))
    }));
    let recorder = Rc::new(Recorder::default());
    let ops = Operations::new(&provider, registry, recorder.clone());

    let output = ops.reset("local", false).unwrap();

    assert_eq!(
        seen.borrow().clone(),
        vec!["preflight:local", "resetPrepare:local", "resetFinished:local"]
    );
    assert_eq!(output.results["audited"], "yes");
    assert_eq!(recorder.commands().first().map(String::as_str), Some("drush updb -y"));
}
