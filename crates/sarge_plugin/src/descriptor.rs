//! Declarative inputs: the per-deployment descriptor kept under `etc/deployments`
//! and the per-version application descriptor (`sargeapp.yaml`) shipped inside
//! a version or instance folder.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::PluginError;

/// Candidate file names for the application descriptor, checked in order.
pub const APP_DESCRIPTOR_FILES: [&str; 3] = ["sargeapp.yaml", "sargeapp.yml", "sargeapp.json"];

/// Name given to the single program of a deployment that only declares `command`.
pub const DEFAULT_PROGRAM: &str = "app";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    /// Resurrect the process whenever it exits.
    Always,
    /// Leave exited processes alone. One-shot and externally triggered
    /// processes rely on this.
    #[default]
    Never,
}

/// A named command run under supervision.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: String,
    pub command: String,
}

/// A required service such as `scratch-folder` or `persistent-folder`.
///
/// Unknown keys are kept in `extra` so plugins can read their own settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServiceSpec {
    pub fn new<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// Deployment descriptor, one file per deployment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DeploymentConfig {
    /// Unique deployment name.
    pub name: String,
    /// Owning user for created folders and supervised processes.
    #[serde(default)]
    pub user: Option<String>,
    /// Single shell command; mutually exclusive with `programs`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub programs: Vec<ProgramSpec>,
    #[serde(default)]
    pub autorestart: AutoRestart,
    #[serde(default)]
    pub require_services: Vec<ServiceSpec>,
    /// `module:attribute` of a WSGI callable served through a generated launcher.
    #[serde(default)]
    pub quick_wsgi_app: Option<String>,
    /// Extra environment exported to every program of this deployment.
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
}

impl DeploymentConfig {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            user: None,
            command: None,
            programs: Vec::new(),
            autorestart: AutoRestart::Never,
            require_services: Vec::new(),
            quick_wsgi_app: None,
            environ: BTreeMap::new(),
        }
    }

    /// The declared programs, with `command` expanded to a single program.
    pub fn program_specs(&self) -> Vec<ProgramSpec> {
        let mut specs = Vec::new();
        if let Some(command) = &self.command {
            specs.push(ProgramSpec {
                name: DEFAULT_PROGRAM.to_string(),
                command: command.clone(),
            });
        }
        specs.extend(self.programs.iter().cloned());
        specs
    }
}

/// One routing entry of an application's `urlmap`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UrlEntry {
    /// Serve files from `path`, relative to the version folder.
    Static { url: String, path: String },
    /// WSGI app over FastCGI; defaults to the quick-app socket in the run folder.
    Wsgi {
        url: String,
        #[serde(default)]
        socket: Option<String>,
    },
    /// Any FastCGI responder listening on `socket`.
    Fcgi { url: String, socket: String },
    /// PHP scripts below `path` handed to a FastCGI socket.
    Php { url: String, path: String, socket: String },
    /// Reverse proxy to an upstream URL.
    Proxy { url: String, upstream: String },
}

impl UrlEntry {
    pub fn url(&self) -> &str {
        match self {
            UrlEntry::Static { url, .. }
            | UrlEntry::Wsgi { url, .. }
            | UrlEntry::Fcgi { url, .. }
            | UrlEntry::Php { url, .. }
            | UrlEntry::Proxy { url, .. } => url,
        }
    }
}

/// Application descriptor shipped inside a version folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AppDescriptor {
    #[serde(default)]
    pub urlmap: Vec<UrlEntry>,
    #[serde(default, alias = "nginx_options")]
    pub nginx_options: BTreeMap<String, String>,
    /// Passed through verbatim into the AppConfig `services` map.
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    #[serde(default)]
    pub require_services: Vec<ServiceSpec>,
}

impl AppDescriptor {
    /// Locate the descriptor inside `folder`.
    pub fn find(folder: &Path) -> Option<PathBuf> {
        APP_DESCRIPTOR_FILES
            .iter()
            .map(|name| folder.join(name))
            .find(|path| path.is_file())
    }

    /// Load the descriptor from `folder`, or `None` when the folder ships none.
    pub fn load(folder: &Path) -> Result<Option<Self>, PluginError> {
        let Some(path) = Self::find(folder) else {
            return Ok(None);
        };
        let content = fs::read_to_string(&path).map_err(|e| PluginError::io(&path, e))?;
        let parsed = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|e| PluginError::Descriptor {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            serde_yaml_bw::from_str(&content).map_err(|e| PluginError::Descriptor {
                path: path.clone(),
                reason: e.to_string(),
            })?
        };
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn command_expands_to_default_program() {
        let mut cfg = DeploymentConfig::new("blog");
        cfg.command = Some("./serve".into());
        cfg.programs.push(ProgramSpec {
            name: "worker".into(),
            command: "./work".into(),
        });

        let specs = cfg.program_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, DEFAULT_PROGRAM);
        assert_eq!(specs[1].name, "worker");
    }

    #[test]
    fn descriptor_yaml_with_services_and_autorestart() {
        let yaml = r#"
name: blog
user: www
command: ./serve
autorestart: always
require-services:
  - type: persistent-folder
    name: uploads
    mode: "0750"
"#;
        let cfg: DeploymentConfig = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(cfg.autorestart, AutoRestart::Always);
        assert_eq!(cfg.user.as_deref(), Some("www"));
        assert_eq!(cfg.require_services[0].kind, "persistent-folder");
        assert_eq!(
            cfg.require_services[0].extra.get("mode"),
            Some(&Value::String("0750".into()))
        );
    }

    #[test]
    fn autorestart_defaults_to_never() {
        let cfg: DeploymentConfig = serde_yaml_bw::from_str("name: blog\n").unwrap();
        assert_eq!(cfg.autorestart, AutoRestart::Never);
        assert!(cfg.program_specs().is_empty());
    }

    #[test]
    fn app_descriptor_loads_urlmap_in_order() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("sargeapp.yaml"),
            r#"
urlmap:
  - { url: /media, type: static, path: mymedia }
  - { url: /, type: wsgi }
  - { url: /api, type: proxy, upstream: "http://127.0.0.1:9000" }
nginx_options:
  listen: "8080"
services:
  cache: { host: localhost }
"#,
        )
        .unwrap();

        let desc = AppDescriptor::load(dir.path()).unwrap().unwrap();
        let urls: Vec<&str> = desc.urlmap.iter().map(UrlEntry::url).collect();
        assert_eq!(urls, vec!["/media", "/", "/api"]);
        assert_eq!(desc.nginx_options.get("listen").map(String::as_str), Some("8080"));
        assert!(desc.services.contains_key("cache"));
    }

    #[test]
    fn missing_app_descriptor_is_none() {
        let dir = tempdir().unwrap();
        assert!(AppDescriptor::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn unknown_route_type_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("sargeapp.json"),
            r#"{"urlmap": [{"url": "/", "type": "gopher"}]}"#,
        )
        .unwrap();
        let err = AppDescriptor::load(dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::Descriptor { .. }));
    }
}
