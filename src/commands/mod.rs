use std::collections::BTreeMap;
use std::io::IsTerminal;

use fabalicious::operations::Operations;
use fabalicious::{Error, YamlConfigurationProvider};

pub type CmdResult<T> = fabalicious::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    /// Explicit fabfile; discovered upwards from the working directory otherwise.
    pub file: Option<String>,
}

impl GlobalArgs {
    pub fn provider(&self) -> fabalicious::Result<YamlConfigurationProvider> {
        YamlConfigurationProvider::open(self.file.as_deref())
    }
}

/// Load the fabfile and run `operation` against it with the built-in methods.
pub(crate) fn with_operations<T>(
    global: &GlobalArgs,
    operation: impl FnOnce(&Operations<'_>) -> fabalicious::Result<T>,
) -> CmdResult<T> {
    let provider = global.provider()?;
    let operations = Operations::with_defaults(&provider);
    let output = operation(&operations)?;
    Ok((output, 0))
}

// ============================================================================
// Parameter parsing (CLI layer)
// ============================================================================

/// Parse `key=value` task parameters.
pub fn parse_params(raw: &[String]) -> fabalicious::Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for item in raw {
        let (key, value) = item.split_once('=').ok_or_else(|| {
            Error::validation_invalid_argument(
                "params",
                format!("Expected key=value, got '{}'", item),
            )
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation_invalid_argument(
                "params",
                format!("Empty parameter name in '{}'", item),
            ));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

pub fn require_tty_for_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn status(message: &str) {
    if std::io::stderr().is_terminal() {
        eprintln!("{}", message);
    }
}

pub mod copy;
pub mod inspect;
pub mod tasks;
pub mod tools;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $handler:path) => {
        crate::output::map_cmd_result_to_json($handler($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (fabalicious::Result<serde_json::Value>, i32) {
    status("fabalicious is working...");

    match command {
        crate::Commands::Reset(args) => dispatch!(args, global, tasks::reset),
        crate::Commands::Deploy(args) => dispatch!(args, global, tasks::deploy),
        crate::Commands::Backup(args) => dispatch!(args, global, tasks::backup),
        crate::Commands::BackupDb(args) => dispatch!(args, global, tasks::backup_db),
        crate::Commands::Run(args) => dispatch!(args, global, tasks::run),

        crate::Commands::CopyFrom(args) => dispatch!(args, global, copy::copy_from),
        crate::Commands::CopyDbFrom(args) => dispatch!(args, global, copy::copy_db_from),
        crate::Commands::CopyFilesFrom(args) => dispatch!(args, global, copy::copy_files_from),

        crate::Commands::Docker(args) => dispatch!(args, global, tools::docker),
        crate::Commands::Drush(args) => dispatch!(args, global, tools::drush),
        crate::Commands::Drupalconsole(args) => dispatch!(args, global, tools::drupalconsole),
        crate::Commands::Composer(args) => dispatch!(args, global, tools::composer),
        crate::Commands::Script(args) => dispatch!(args, global, tools::script),
        crate::Commands::Notify(args) => dispatch!(args, global, tools::notify),

        crate::Commands::Version(args) => dispatch!(args, global, inspect::version),
        crate::Commands::List => dispatch!((), global, inspect::list),
        crate::Commands::GetProperty(args) => dispatch!(args, global, inspect::get_property),
        crate::Commands::About(args) => dispatch!(args, global, inspect::about),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        let params = parse_params(&["cmd=ls -la".to_string(), "q=a=b".to_string()]).unwrap();
        assert_eq!(params["cmd"], "ls -la");
        assert_eq!(params["q"], "a=b");
    }

    #[test]
    fn params_without_equals_are_rejected() {
        let err = parse_params(&["oops".to_string()]).unwrap_err();
        assert_eq!(err.code, fabalicious::ErrorCode::ValidationInvalidArgument);
        assert!(parse_params(&["=x".to_string()]).is_err());
    }
}
