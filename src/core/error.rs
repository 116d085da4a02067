use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidValue,
    ConfigInvalidYaml,
    ConfigFileNotFound,
    ConfigEnvironmentNotFound,

    ValidationMissingArgument,
    ValidationInvalidArgument,

    MethodUnknown,
    MethodMissingTask,

    ScriptSubtaskNotFound,
    ScriptSubtaskCycle,
    ScriptUnresolvedPlaceholder,

    TunnelTimeout,
    TunnelAddressUnresolved,

    RemoteCommandFailed,
    GitWorkingCopyDirty,

    NotifyFailed,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigInvalidYaml => "config.invalid_yaml",
            ErrorCode::ConfigFileNotFound => "config.file_not_found",
            ErrorCode::ConfigEnvironmentNotFound => "config.environment_not_found",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::MethodUnknown => "method.unknown",
            ErrorCode::MethodMissingTask => "method.missing_task",

            ErrorCode::ScriptSubtaskNotFound => "script.subtask_not_found",
            ErrorCode::ScriptSubtaskCycle => "script.subtask_cycle",
            ErrorCode::ScriptUnresolvedPlaceholder => "script.unresolved_placeholder",

            ErrorCode::TunnelTimeout => "tunnel.timeout",
            ErrorCode::TunnelAddressUnresolved => "tunnel.address_unresolved",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::GitWorkingCopyDirty => "git.working_copy_dirty",

            ErrorCode::NotifyFailed => "notify.failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

pub fn all_codes() -> &'static [ErrorCode] {
    &[
        ErrorCode::ConfigMissingKey,
        ErrorCode::ConfigInvalidValue,
        ErrorCode::ConfigInvalidYaml,
        ErrorCode::ConfigFileNotFound,
        ErrorCode::ConfigEnvironmentNotFound,
        ErrorCode::ValidationMissingArgument,
        ErrorCode::ValidationInvalidArgument,
        ErrorCode::MethodUnknown,
        ErrorCode::MethodMissingTask,
        ErrorCode::ScriptSubtaskNotFound,
        ErrorCode::ScriptSubtaskCycle,
        ErrorCode::ScriptUnresolvedPlaceholder,
        ErrorCode::TunnelTimeout,
        ErrorCode::TunnelAddressUnresolved,
        ErrorCode::RemoteCommandFailed,
        ErrorCode::GitWorkingCopyDirty,
        ErrorCode::NotifyFailed,
        ErrorCode::InternalIoError,
        ErrorCode::InternalJsonError,
        ErrorCode::InternalUnexpected,
    ]
}

pub fn parse_code(code: &str) -> Option<ErrorCode> {
    all_codes()
        .iter()
        .copied()
        .find(|candidate| candidate.as_str() == code)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingTaskDetails {
    pub method: String,
    pub task: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedPlaceholderDetails {
    pub lines: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDetails {
    pub config_name: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            serde_json::json!({ "args": args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            serde_json::json!({ "field": field.into(), "problem": problem }),
        )
    }

    pub fn config_missing_key(key: impl Into<String>, config_name: Option<String>) -> Self {
        let key = key.into();
        let message = match &config_name {
            Some(name) => format!("Configuration '{}' is missing key '{}'", name, key),
            None => format!("Missing required configuration key '{}'", key),
        };
        Self::new(
            ErrorCode::ConfigMissingKey,
            message,
            to_details(ConfigMissingKeyDetails { key, config_name }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            to_details(ConfigInvalidValueDetails {
                key: key.into(),
                value,
                problem: problem.into(),
            }),
        )
    }

    pub fn config_invalid_yaml(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidYaml,
            "Invalid YAML in configuration file",
            serde_json::json!({ "path": path.into(), "error": error.into() }),
        )
    }

    pub fn config_file_not_found(searched_from: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConfigFileNotFound,
            "No fabfile.yaml found",
            serde_json::json!({ "searchedFrom": searched_from.into() }),
        )
        .with_hint("Run from inside a project containing fabfile.yaml, or pass --file")
    }

    pub fn environment_not_found(id: impl Into<String>, available: Vec<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::ConfigEnvironmentNotFound,
            format!("Configuration '{}' not found", id),
            to_details(NotFoundDetails { id, available }),
        )
        .with_hint("Run 'fabalicious list' to see available configurations")
    }

    pub fn method_unknown(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::MethodUnknown,
            format!("No method supporting \"{}\" found", name),
            to_details(NotFoundDetails {
                id: name,
                available: Vec::new(),
            }),
        )
        .with_hint("Check the 'needs' list of the configuration for typos")
    }

    pub fn method_missing_task(method: impl Into<String>, task: impl Into<String>) -> Self {
        let method = method.into();
        let task = task.into();
        Self::new(
            ErrorCode::MethodMissingTask,
            format!("Task \"{}\" in method \"{}\" not found", task, method),
            to_details(MissingTaskDetails { method, task }),
        )
    }

    pub fn script_subtask_not_found(name: impl Into<String>, available: Vec<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::ScriptSubtaskNotFound,
            format!("Subtask '{}' not found in scripts", name),
            to_details(NotFoundDetails {
                id: name,
                available,
            }),
        )
    }

    pub fn script_subtask_cycle(chain: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ScriptSubtaskCycle,
            format!("Script references form a cycle: {}", chain.join(" -> ")),
            serde_json::json!({ "chain": chain }),
        )
    }

    pub fn script_unresolved_placeholder(lines: Vec<String>) -> Self {
        let message = match lines.first() {
            Some(line) => format!(
                "Found replacement-pattern in script-line '{}', aborting",
                line
            ),
            None => "Found replacement-pattern in script, aborting".to_string(),
        };
        Self::new(
            ErrorCode::ScriptUnresolvedPlaceholder,
            message,
            to_details(UnresolvedPlaceholderDetails { lines }),
        )
    }

    pub fn tunnel_timeout(details: TunnelDetails) -> Self {
        Self::new(
            ErrorCode::TunnelTimeout,
            "SSH tunnel timed out",
            to_details(details),
        )
    }

    pub fn tunnel_address_unresolved(config_name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::TunnelAddressUnresolved,
            "Could not get remote ip-address from existing methods",
            serde_json::json!({ "configName": config_name.into() }),
        )
        .with_hint("Set sshTunnel.destHost or add a method providing getIpAddress (e.g. docker)")
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!("Remote command failed: {}", details.command);
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn git_working_copy_dirty(config_name: impl Into<String>, folder: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::GitWorkingCopyDirty,
            "Working copy is not clean, aborting",
            serde_json::json!({ "configName": config_name.into(), "folder": folder.into() }),
        )
        .with_hint("Commit or stash local changes on the host before deploying")
    }

    pub fn notify_failed(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::NotifyFailed,
            "Sending notification failed",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::MethodUnknown
                | ErrorCode::MethodMissingTask
                | ErrorCode::ScriptSubtaskNotFound
                | ErrorCode::ScriptSubtaskCycle
        )
    }
}
