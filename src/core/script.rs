//! Configuration-stored remote scripts.
//!
//! A script is a list of lines. Each line is one of:
//! - `run_task(<name>)`: replaced by the lines of another script of the same table
//! - `<callback>(<arg>, ...)`: runs a registered callback
//! - anything else: a command template with `%key%` placeholders, run remotely
//!
//! Running a script expands references, substitutes placeholders, rejects any
//! line that still carries a placeholder, then executes line by line.

use crate::config::{scalar_to_string, Configuration, DockerHost};
use crate::error::{Error, Result};
use crate::executor::{CommandRequest, HostTarget, RemoteExecutor};
use crate::utils::template;
use owo_colors::OwoColorize;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Mutable state shared by all lines of one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptState {
    /// Failing commands only warn while set.
    pub warn_only: bool,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self { warn_only: true }
    }
}

// ============================================================================
// Expansion
// ============================================================================

fn subtask_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*run_task\((.*)\)\s*$").expect("subtask pattern is valid")
    })
}

fn call_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\((.*)\)\s*$").expect("call pattern is valid")
    })
}

/// Flatten script `name`, inlining `run_task(...)` references depth-first.
pub fn expand(scripts: &BTreeMap<String, Vec<String>>, name: &str) -> Result<Vec<String>> {
    let mut stack = Vec::new();
    let mut commands = Vec::new();
    expand_script(scripts, name, &mut stack, &mut commands)?;
    Ok(commands)
}

/// Flatten free-standing lines whose references point into `scripts`.
pub fn expand_lines(scripts: &BTreeMap<String, Vec<String>>, lines: &[String]) -> Result<Vec<String>> {
    let mut stack = Vec::new();
    let mut commands = Vec::new();
    expand_into(scripts, lines, &mut stack, &mut commands)?;
    Ok(commands)
}

fn expand_script(
    scripts: &BTreeMap<String, Vec<String>>,
    name: &str,
    stack: &mut Vec<String>,
    commands: &mut Vec<String>,
) -> Result<()> {
    if stack.iter().any(|entry| entry == name) {
        let mut chain = stack.clone();
        chain.push(name.to_string());
        return Err(Error::script_subtask_cycle(chain));
    }

    let lines = scripts
        .get(name)
        .ok_or_else(|| Error::script_subtask_not_found(name, scripts.keys().cloned().collect()))?;

    stack.push(name.to_string());
    expand_into(scripts, lines, stack, commands)?;
    stack.pop();
    Ok(())
}

fn expand_into(
    scripts: &BTreeMap<String, Vec<String>>,
    lines: &[String],
    stack: &mut Vec<String>,
    commands: &mut Vec<String>,
) -> Result<()> {
    for line in lines {
        match subtask_regex().captures(line) {
            Some(caps) => expand_script(scripts, caps[1].trim(), stack, commands)?,
            None => commands.push(line.clone()),
        }
    }
    Ok(())
}

// ============================================================================
// Substitution
// ============================================================================

const GUEST_KEYS: &[&str] = &["user", "host", "port", "branch", "rootFolder", "gitRootFolder"];

/// Layered `%key%` values; later layers override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replacements {
    values: BTreeMap<String, String>,
}

impl Replacements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment settings as `%guest.<key>%`.
    pub fn guest(mut self, config: &Configuration) -> Self {
        for key in GUEST_KEYS {
            if let Some(value) = config.string(key) {
                self.values.insert(format!("guest.{}", key), value);
            }
        }
        self
    }

    /// Docker host login and root folder as `%key%`.
    pub fn docker_host(mut self, host: &DockerHost) -> Self {
        self.values.insert("user".to_string(), host.user.clone());
        self.values.insert("host".to_string(), host.host.clone());
        self.values.insert("port".to_string(), host.port.to_string());
        self.values
            .insert("rootFolder".to_string(), host.root_folder.clone());
        self
    }

    /// All scalar values of a configuration as `%key%`.
    pub fn scalars(mut self, config: &Configuration) -> Self {
        for (key, value) in config.values() {
            if let Some(value) = scalar_to_string(value) {
                self.values.insert(key.clone(), value);
            }
        }
        self
    }

    pub fn entries<'a, I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in entries {
            self.values.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn apply(&self, lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .map(|line| template::render_map(line, &self.values))
            .collect()
    }
}

/// Reject lines that still carry a `%token%`.
pub fn validate(lines: &[String]) -> Result<()> {
    let offending: Vec<String> = lines
        .iter()
        .filter(|line| template::has_placeholders(line))
        .cloned()
        .collect();
    if offending.is_empty() {
        Ok(())
    } else {
        Err(Error::script_unresolved_placeholder(offending))
    }
}

/// Split `name(a, b)` into its name and trimmed arguments.
pub fn parse_call(line: &str) -> Option<(String, Vec<String>)> {
    let caps = call_regex().captures(line)?;
    let inner = caps[2].trim();
    let args = if inner.is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(|arg| arg.trim().to_string()).collect()
    };
    Some((caps[1].to_string(), args))
}

// ============================================================================
// Callbacks
// ============================================================================

pub type Callback<'a> = Box<dyn Fn(&mut ScriptState, &[String]) -> Result<()> + 'a>;

/// Named functions script lines may invoke.
#[derive(Default)]
pub struct Callbacks<'a> {
    table: BTreeMap<String, Callback<'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// `fail_on_error` and `echo`.
    pub fn builtin() -> Self {
        Self::new()
            .with("fail_on_error", fail_on_error)
            .with("echo", echo)
    }

    pub fn with<F>(mut self, name: &str, callback: F) -> Self
    where
        F: Fn(&mut ScriptState, &[String]) -> Result<()> + 'a,
    {
        self.table.insert(name.to_string(), Box::new(callback));
        self
    }

    fn invoke(&self, name: &str, state: &mut ScriptState, args: &[String]) -> Option<Result<()>> {
        self.table.get(name).map(|callback| callback(state, args))
    }
}

/// `fail_on_error(1)` makes failing commands abort the script; any other
/// flag restores warnings only.
pub fn fail_on_error(state: &mut ScriptState, args: &[String]) -> Result<()> {
    state.warn_only = args.first().map(String::as_str) != Some("1");
    Ok(())
}

/// `echo(text, color?)` prints to stderr, optionally coloured.
pub fn echo(_state: &mut ScriptState, args: &[String]) -> Result<()> {
    let text = args.first().map(String::as_str).unwrap_or_default();
    match args.get(1).map(String::as_str) {
        Some("red") => eprintln!("{}", text.red()),
        Some("green") => eprintln!("{}", text.green()),
        Some("yellow") => eprintln!("{}", text.yellow()),
        Some("blue") => eprintln!("{}", text.blue()),
        _ => eprintln!("{}", text),
    }
    Ok(())
}

// ============================================================================
// Execution
// ============================================================================

/// What happened to one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LineOutcome {
    Command {
        line: String,
        exit_code: i32,
        success: bool,
    },
    Callback {
        name: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptRun {
    pub lines: Vec<LineOutcome>,
}

impl ScriptRun {
    pub fn failures(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, LineOutcome::Command { success: false, .. }))
            .count()
    }
}

/// Runs substituted script lines on one host.
pub struct ScriptInterpreter<'e> {
    executor: &'e dyn RemoteExecutor,
    target: HostTarget,
}

impl<'e> ScriptInterpreter<'e> {
    pub fn new(executor: &'e dyn RemoteExecutor, target: HostTarget) -> Self {
        Self { executor, target }
    }

    /// Run `commands` inside `root_folder`.
    ///
    /// Nothing runs when any line still carries a placeholder. Call-shaped lines
    /// naming an unregistered callback run as plain commands.
    pub fn run(
        &self,
        root_folder: &str,
        commands: &[String],
        callbacks: &Callbacks<'_>,
    ) -> Result<ScriptRun> {
        validate(commands)?;

        let mut state = ScriptState::default();
        let mut run = ScriptRun::default();

        for line in commands {
            if let Some((name, args)) = parse_call(line) {
                if let Some(result) = callbacks.invoke(&name, &mut state, &args) {
                    result?;
                    run.lines.push(LineOutcome::Callback { name, args });
                    continue;
                }
            }

            let request = CommandRequest::new(line.clone())
                .in_dir(root_folder)
                .tolerating(state.warn_only);
            let output = self.executor.run(&self.target, &request)?;
            run.lines.push(LineOutcome::Command {
                line: line.clone(),
                exit_code: output.exit_code,
                success: output.success,
            });
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{failing, RecordingExecutor};
    use crate::ErrorCode;
    use std::cell::RefCell;

    fn scripts(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(name, lines)| {
                (
                    name.to_string(),
                    lines.iter().map(|l| l.to_string()).collect(),
                )
            })
            .collect()
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|l| l.to_string()).collect()
    }

    fn target() -> HostTarget {
        HostTarget::new("root", "docker.example.com", 2222)
    }

    #[test]
    fn expansion_without_references_is_identity() {
        let table = scripts(&[("start", &["docker start app", "echo(started)"])]);
        assert_eq!(
            expand(&table, "start").unwrap(),
            lines(&["docker start app", "echo(started)"])
        );
    }

    #[test]
    fn expansion_inlines_references_in_order() {
        let table = scripts(&[
            ("a", &["one", "run_task(b)", "four"]),
            ("b", &["two", "run_task( c )"]),
            ("c", &["three"]),
        ]);
        assert_eq!(
            expand(&table, "a").unwrap(),
            lines(&["one", "two", "three", "four"])
        );
        assert_eq!(expand(&table, "b").unwrap(), lines(&["two", "three"]));
    }

    #[test]
    fn expansion_reports_unknown_and_cyclic_references() {
        let table = scripts(&[("a", &["run_task(missing)"])]);
        let err = expand(&table, "a").unwrap_err();
        assert_eq!(err.code, ErrorCode::ScriptSubtaskNotFound);
        assert_eq!(err.details["id"], "missing");

        let table = scripts(&[("a", &["run_task(b)"]), ("b", &["x", "run_task(a)"])]);
        let err = expand(&table, "a").unwrap_err();
        assert_eq!(err.code, ErrorCode::ScriptSubtaskCycle);
        assert_eq!(err.details["chain"], serde_json::json!(["a", "b", "a"]));
    }

    #[test]
    fn free_lines_expand_against_the_table() {
        let table = scripts(&[("clear", &["drush cc all"])]);
        assert_eq!(
            expand_lines(&table, &lines(&["drush updb -y", "run_task(clear)"])).unwrap(),
            lines(&["drush updb -y", "drush cc all"])
        );
    }

    #[test]
    fn the_same_script_may_be_referenced_twice() {
        let table = scripts(&[("a", &["run_task(b)", "run_task(b)"]), ("b", &["x"])]);
        assert_eq!(expand(&table, "a").unwrap(), lines(&["x", "x"]));
    }

    #[test]
    fn replacement_layers_override_in_priority_order() {
        let config = Configuration::new("staging", &["docker"])
            .with("user", "deploy")
            .with("host", "staging.example.com")
            .with("branch", "develop")
            .with("rootFolder", "/var/www");
        let host = DockerHost {
            id: "default".to_string(),
            host: "docker.example.com".to_string(),
            user: "root".to_string(),
            port: 2222,
            root_folder: "/srv/docker".to_string(),
            tasks: BTreeMap::new(),
            identity_file: None,
        };
        let docker_block: BTreeMap<String, String> =
            [("name".to_string(), "app".to_string()), ("user".to_string(), "docker".to_string())]
                .into_iter()
                .collect();
        let kwargs: BTreeMap<String, String> =
            [("name".to_string(), "override".to_string())].into_iter().collect();

        let replacements = Replacements::new()
            .guest(&config)
            .docker_host(&host)
            .entries(&docker_block)
            .entries(&kwargs);

        assert_eq!(replacements.get("guest.host"), Some("staging.example.com"));
        assert_eq!(replacements.get("guest.branch"), Some("develop"));
        assert_eq!(replacements.get("rootFolder"), Some("/srv/docker"));
        assert_eq!(replacements.get("user"), Some("docker"));
        assert_eq!(replacements.get("name"), Some("override"));

        let rendered = replacements.apply(&lines(&["cd %rootFolder% && git checkout %guest.branch%"]));
        assert_eq!(rendered, lines(&["cd /srv/docker && git checkout develop"]));
        assert!(validate(&rendered).is_ok());
    }

    #[test]
    fn parse_call_splits_and_trims_arguments() {
        assert_eq!(
            parse_call("echo(Done, green)"),
            Some(("echo".to_string(), lines(&["Done", "green"])))
        );
        assert_eq!(parse_call("fail_on_error()"), Some(("fail_on_error".to_string(), vec![])));
        assert_eq!(parse_call("mkdir /srv/app"), None);
    }

    #[test]
    fn unresolved_placeholder_runs_nothing() {
        let executor = RecordingExecutor::new();
        let interpreter = ScriptInterpreter::new(&executor, target());
        let err = interpreter
            .run(
                "/srv",
                &lines(&["echo ok", "mkdir %missing%"]),
                &Callbacks::builtin(),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ScriptUnresolvedPlaceholder);
        assert_eq!(err.details["lines"], serde_json::json!(["mkdir %missing%"]));
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn commands_and_callbacks_run_in_order() {
        let executor = RecordingExecutor::new();
        let seen = RefCell::new(Vec::new());
        let callbacks = Callbacks::builtin().with("note", |_, args: &[String]| {
            seen.borrow_mut().push(args.to_vec());
            Ok(())
        });

        let table = scripts(&[("setup", &["mkdir %rootFolder%", "note(Done,green)"])]);
        let config = Configuration::new("local", &[]).with("rootFolder", "/srv/app");
        let commands = Replacements::new()
            .scalars(&config)
            .apply(&expand(&table, "setup").unwrap());
        assert_eq!(commands, lines(&["mkdir /srv/app", "note(Done,green)"]));

        let run = ScriptInterpreter::new(&executor, target())
            .run("/srv/app", &commands, &callbacks)
            .unwrap();

        assert_eq!(executor.commands(), lines(&["mkdir /srv/app"]));
        assert_eq!(seen.borrow().clone(), vec![lines(&["Done", "green"])]);
        assert_eq!(run.lines.len(), 2);
        let calls = executor.calls.borrow();
        let (_, request) = &calls[0];
        assert_eq!(request.cwd.as_deref(), Some("/srv/app"));
        assert!(request.tolerate_failure);
    }

    #[test]
    fn builtin_echo_is_dispatched_as_a_callback() {
        let executor = RecordingExecutor::new();
        let run = ScriptInterpreter::new(&executor, target())
            .run(
                "/srv",
                &lines(&["mkdir /srv/app", "echo(Done,green)"]),
                &Callbacks::builtin(),
            )
            .unwrap();

        assert_eq!(executor.commands(), lines(&["mkdir /srv/app"]));
        assert_eq!(run.lines.len(), 2);
        assert_eq!(
            run.lines[1],
            LineOutcome::Callback {
                name: "echo".to_string(),
                args: lines(&["Done", "green"]),
            }
        );
    }

    #[test]
    fn unregistered_call_shaped_lines_run_as_commands() {
        let executor = RecordingExecutor::new();
        ScriptInterpreter::new(&executor, target())
            .run("/srv", &lines(&["restart(nginx)"]), &Callbacks::builtin())
            .unwrap();
        assert_eq!(executor.commands(), lines(&["restart(nginx)"]));
    }

    #[test]
    fn failures_are_tolerated_until_fail_on_error() {
        let executor = RecordingExecutor::new();
        executor.respond("false", failing(1));
        let interpreter = ScriptInterpreter::new(&executor, target());

        let run = interpreter
            .run("/srv", &lines(&["false", "true"]), &Callbacks::builtin())
            .unwrap();
        assert_eq!(run.failures(), 1);

        let err = interpreter
            .run(
                "/srv",
                &lines(&["fail_on_error(1)", "false", "never"]),
                &Callbacks::builtin(),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert!(!executor.commands().contains(&"never".to_string()));
    }

    #[test]
    fn fail_on_error_flag_toggles_tolerance() {
        let mut state = ScriptState::default();
        fail_on_error(&mut state, &lines(&["1"])).unwrap();
        assert!(!state.warn_only);
        fail_on_error(&mut state, &lines(&["0"])).unwrap();
        assert!(state.warn_only);
    }
}
