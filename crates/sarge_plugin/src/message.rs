use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{descriptor::ServiceSpec, plugin::PluginError};

/// Environment variable pointing a running process at its AppConfig artifact.
pub const APPCFG_ENV: &str = "SARGEAPP_CFG";

/// Socket file name the quick WSGI launcher binds inside the run folder.
pub const QUICK_WSGI_SOCKET: &str = "wsgi-app.sock";

/// A program to run under the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Working directory; the version or instance folder when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Program {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            environment: BTreeMap::new(),
            directory: None,
        }
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, directory: P) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

/// Configuration assembled by plugins and handed to the running process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Service name to connection info or path.
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    /// Environment exports.
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn set_service<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        self.services.insert(name.into(), value.into());
    }

    pub fn service(&self, name: &str) -> Option<&Value> {
        self.services.get(name)
    }

    pub fn export<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.environ.insert(key.into(), value.into());
    }

    pub fn to_json(&self) -> Result<String, PluginError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a previously written artifact back.
    pub fn read(path: &Path) -> Result<Self, PluginError> {
        let content = fs::read_to_string(path).map_err(|e| PluginError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Shared state threaded through the plugin pipeline of one activation.
///
/// Plugins append programs and set AppConfig keys; they never replace the
/// whole structure.
#[derive(Debug, Clone, Default)]
pub struct ActivationContext {
    pub programs: Vec<Program>,
    pub app_config: AppConfig,
}

impl ActivationContext {
    pub fn new(programs: Vec<Program>) -> Self {
        Self {
            programs,
            app_config: AppConfig::default(),
        }
    }

    pub fn add_program(&mut self, program: Program) {
        self.programs.push(program);
    }

    pub fn set_service<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        self.app_config.set_service(name, value);
    }

    pub fn export<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.app_config.export(key, value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TargetKind {
    Deployment,
    Instance,
}

/// What an event is about, as seen by plugins.
#[derive(Debug, Clone)]
pub struct Target {
    pub kind: TargetKind,
    /// Deployment name or instance id.
    pub name: String,
    /// Key matched by application-name filters.
    pub app_name: String,
    /// Version folder for deployments, instance folder for instances.
    pub folder: PathBuf,
    /// Where runtime artifacts (sockets, logs, generated site files) go.
    pub run_folder: PathBuf,
    pub services: Vec<ServiceSpec>,
}

impl Target {
    pub fn services_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a ServiceSpec> + 'a {
        self.services.iter().filter(move |s| s.kind == kind)
    }
}
