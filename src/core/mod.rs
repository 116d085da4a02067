// Public modules
pub mod config;
pub mod error;
pub mod executor;
pub mod method;
pub mod operations;
pub mod orchestrator;
pub mod script;
pub mod ssh;
pub mod tunnel;

// Internal modules - not part of public API
pub(crate) mod paths;

// Re-export common types for convenience
pub use config::{Configuration, ConfigurationProvider, Settings, YamlConfigurationProvider};
pub use error::{Error, ErrorCode, Result};
pub use executor::{CommandOutput, CommandRequest, HostTarget, RemoteExecutor, SshExecutor};
pub use method::{HookContext, Method, MethodRegistry, Requirement, TaskArgs};
pub use orchestrator::TaskOrchestrator;
