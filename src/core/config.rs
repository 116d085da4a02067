//! Resolved environment configuration and the YAML-backed provider.
//!
//! A `fabfile.yaml` holds global settings at the top level and one block per
//! environment under `hosts`. Resolution layers built-in defaults, the global
//! `needs` list and the environment block into one immutable `Configuration`.

use crate::error::{Error, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_NEEDS: &[&str] = &["ssh", "git", "drush"];

// ============================================================================
// Value helpers
// ============================================================================

/// Render a scalar as the string used in commands. Mappings, sequences and null
/// have no scalar form.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// All scalar entries of a mapping, stringified.
pub fn scalar_entries(map: &Map<String, Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(key, value)| scalar_to_string(value).map(|s| (key.clone(), s)))
        .collect()
}

fn as_lines(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(scalar_to_string).collect())
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Recursively merge `overlay` into `base`. Mappings merge key by key, anything
/// else is replaced.
fn merge_into(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ============================================================================
// Configuration
// ============================================================================

/// Resolved settings of one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: Map<String, Value>,
}

impl Configuration {
    /// Build a configuration with only identity and needs set.
    pub fn new(name: &str, needs: &[&str]) -> Self {
        let mut values = Map::new();
        values.insert("config_name".to_string(), Value::from(name));
        values.insert(
            "needs".to_string(),
            Value::Array(needs.iter().map(|n| Value::from(*n)).collect()),
        );
        Self { values }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(values) = value else {
            return Err(Error::config_invalid_value(
                "configuration",
                None,
                "configuration must be a mapping",
            ));
        };

        let name = values
            .get("config_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config_missing_key("config_name", None))?
            .to_string();

        match values.get("needs") {
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
            Some(other) => {
                return Err(Error::config_invalid_value(
                    "needs",
                    Some(other.to_string()),
                    "needs must be a list of method names",
                ))
            }
            None => return Err(Error::config_missing_key("needs", Some(name))),
        }

        Ok(Self { values })
    }

    /// Builder-style setter, mostly for assembling configurations in code.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        self.values
            .get("config_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn needs(&self) -> Vec<String> {
        self.values
            .get("needs")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.string(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config_missing_key(key, Some(self.name().to_string())))
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(as_flag).unwrap_or(default)
    }

    pub fn block(&self, key: &str) -> Option<&Map<String, Value>> {
        self.values.get(key).and_then(Value::as_object)
    }

    pub fn lines(&self, key: &str) -> Option<Vec<String>> {
        self.values.get(key).and_then(as_lines)
    }

    /// Look up a nested value with a `/`-separated path, e.g. `docker/name`.
    pub fn property(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.values, path)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

// ============================================================================
// Settings
// ============================================================================

/// A docker host as declared under `dockerHosts` in the global settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerHost {
    #[serde(skip_deserializing, default)]
    pub id: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub root_folder: String,
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_port() -> u16 {
    22
}

/// Global, environment-independent settings of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: Map<String, Value>,
}

impl Settings {
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn name(&self) -> String {
        self.string("name").unwrap_or_else(|| "unnamed".to_string())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    pub fn block(&self, key: &str) -> Option<&Map<String, Value>> {
        self.values.get(key).and_then(Value::as_object)
    }

    pub fn lines(&self, key: &str) -> Option<Vec<String>> {
        self.values.get(key).and_then(as_lines)
    }

    /// Look up a docker host by its configuration name.
    pub fn docker_host(&self, id: &str) -> Result<DockerHost> {
        let hosts = self.block("dockerHosts").ok_or_else(|| {
            Error::config_missing_key("dockerHosts", None)
                .with_hint("Declare dockerHosts in the global section of fabfile.yaml")
        })?;

        let raw = hosts.get(id).ok_or_else(|| {
            Error::config_invalid_value(
                "docker.configuration",
                Some(id.to_string()),
                format!(
                    "no docker configuration '{}' in dockerHosts (available: {})",
                    id,
                    hosts.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;

        let mut host: DockerHost = serde_json::from_value(raw.clone()).map_err(|e| {
            Error::config_invalid_value(format!("dockerHosts/{}", id), None, e.to_string())
        })?;
        host.id = id.to_string();
        Ok(host)
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Supplies resolved configurations by environment name.
pub trait ConfigurationProvider {
    fn configuration(&self, name: &str) -> Result<Configuration>;
    fn settings(&self) -> &Settings;
    fn names(&self) -> Vec<String>;
}

/// Provider reading a single `fabfile.yaml`.
#[derive(Debug, Clone)]
pub struct YamlConfigurationProvider {
    path: PathBuf,
    settings: Settings,
    hosts: Map<String, Value>,
}

impl YamlConfigurationProvider {
    /// Load from an explicit file, or discover `fabfile.yaml` upwards from the
    /// current directory.
    pub fn open(file: Option<&str>) -> Result<Self> {
        match file {
            Some(path) => Self::load(&paths::expand(path)),
            None => {
                let cwd = std::env::current_dir()
                    .map_err(|e| Error::internal_io(e.to_string(), Some("current dir".into())))?;
                let path = paths::find_fabfile(&cwd)
                    .ok_or_else(|| Error::config_file_not_found(cwd.display().to_string()))?;
                Self::load(&path)
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::config_file_not_found(path.display().to_string()),
            _ => Error::internal_io(e.to_string(), Some(format!("read {}", path.display()))),
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let document: Value = serde_yml::from_str(content)
            .map_err(|e| Error::config_invalid_yaml(path.display().to_string(), e.to_string()))?;

        let Value::Object(mut root) = document else {
            return Err(Error::config_invalid_yaml(
                path.display().to_string(),
                "top level must be a mapping",
            ));
        };

        let hosts = match root.remove("hosts") {
            Some(Value::Object(hosts)) => hosts,
            Some(_) => {
                return Err(Error::config_invalid_value(
                    "hosts",
                    None,
                    "hosts must be a mapping of configuration names",
                ))
            }
            None => return Err(Error::config_missing_key("hosts", None)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            settings: Settings::from_map(root),
            hosts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn defaults() -> Map<String, Value> {
        let defaults = serde_json::json!({
            "port": 22,
            "branch": "master",
            "useForDevelopment": false,
            "supportsBackups": true,
            "supportsCopyFrom": true,
            "supportsZippedBackups": true,
            "ignoreSubmodules": false,
            "backupFolder": "/var/www/backups",
            "tmpFolder": "/tmp",
        });
        match defaults {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl ConfigurationProvider for YamlConfigurationProvider {
    fn configuration(&self, name: &str) -> Result<Configuration> {
        let host = self
            .hosts
            .get(name)
            .ok_or_else(|| Error::environment_not_found(name, self.names()))?;

        let Value::Object(host) = host else {
            return Err(Error::config_invalid_value(
                format!("hosts/{}", name),
                None,
                "configuration block must be a mapping",
            ));
        };

        let mut values = Self::defaults();
        let needs = self
            .settings
            .get("needs")
            .cloned()
            .unwrap_or_else(|| Value::from(DEFAULT_NEEDS.to_vec()));
        values.insert("needs".to_string(), needs);
        merge_into(&mut values, host);

        if let Some(root) = values.get("rootFolder").cloned() {
            for derived in ["gitRootFolder", "siteFolder"] {
                values.entry(derived).or_insert_with(|| root.clone());
            }
        }
        values.insert("config_name".to_string(), Value::from(name));

        Configuration::from_value(Value::Object(values))
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn names(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }
}
