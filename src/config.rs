use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use sarge_plugin::DeploymentConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{IoResultExt, SargeError, SargeResult},
    layout::HomeLayout,
};

static DEPLOYMENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Short random token with collision retry.
    #[default]
    Random,
    /// Persisted counter behind a lock file.
    Counter,
}

fn default_plugins() -> Vec<String> {
    vec!["services".into(), "folders".into(), "listen".into()]
}

fn default_supervisorctl() -> Vec<String> {
    vec!["supervisorctl".into()]
}

fn default_python() -> String {
    "python3".into()
}

/// Main configuration, `etc/sarge.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SargeConfig {
    /// Plugin ids, loaded in this order.
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub id_strategy: IdStrategy,
    /// Process name to stable, externally advertised port.
    #[serde(default)]
    pub port_map: BTreeMap<String, u16>,
    /// Control client argv prefix.
    #[serde(default = "default_supervisorctl")]
    pub supervisorctl: Vec<String>,
    #[serde(default)]
    pub nginx_reload: Option<Vec<String>>,
    #[serde(default)]
    pub lb_reload: Option<Vec<String>>,
    /// Interpreter running generated WSGI launchers.
    #[serde(default = "default_python")]
    pub python: String,
    /// Defaults to `var/tmp` under the home.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    /// Defaults to `var/data` under the home.
    #[serde(default)]
    pub persistent_root: Option<PathBuf>,
    /// Free-form settings for plugins.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Exports added to every AppConfig; merged with `etc/sarge.env`.
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
}

impl Default for SargeConfig {
    fn default() -> Self {
        Self {
            plugins: default_plugins(),
            id_strategy: IdStrategy::default(),
            port_map: BTreeMap::new(),
            supervisorctl: default_supervisorctl(),
            nginx_reload: None,
            lb_reload: None,
            python: default_python(),
            scratch_root: None,
            persistent_root: None,
            options: BTreeMap::new(),
            environ: BTreeMap::new(),
        }
    }
}

impl SargeConfig {
    /// Read `etc/sarge.yaml` (defaults when absent) and fold in `etc/sarge.env`.
    pub fn load(layout: &HomeLayout) -> SargeResult<Self> {
        let path = layout.main_config();
        let mut config = if path.is_file() {
            let text = fs::read_to_string(&path).at(&path)?;
            serde_yaml_bw::from_str(&text).map_err(|source| SargeError::Yaml {
                path: path.clone(),
                source,
            })?
        } else {
            debug!(path = %path.display(), "no main config, using defaults");
            SargeConfig::default()
        };
        config.merge_env_file(&layout.env_file())?;
        Ok(config)
    }

    /// Entries already in `environ` win over the dotenv file.
    fn merge_env_file(&mut self, env_file: &Path) -> SargeResult<()> {
        if !env_file.is_file() {
            return Ok(());
        }
        let iter = dotenvy::from_path_iter(env_file)
            .map_err(|e| SargeError::Config(format!("{}: {e}", env_file.display())))?;
        for item in iter {
            let (key, value) =
                item.map_err(|e| SargeError::Config(format!("{}: {e}", env_file.display())))?;
            self.environ.entry(key).or_insert(value);
        }
        info!(path = %env_file.display(), "loaded environment exports");
        Ok(())
    }

    pub fn to_yaml(&self) -> SargeResult<String> {
        serde_yaml_bw::to_string(self).map_err(|source| SargeError::Yaml {
            path: PathBuf::from(crate::layout::MAIN_CONFIG),
            source,
        })
    }

    pub fn scratch_root(&self, layout: &HomeLayout) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(|| layout.tmp_dir())
    }

    pub fn persistent_root(&self, layout: &HomeLayout) -> PathBuf {
        self.persistent_root.clone().unwrap_or_else(|| layout.data_dir())
    }

    pub fn stable_port(&self, process: &str) -> Option<u16> {
        self.port_map.get(process).copied()
    }
}

pub fn validate_deployment_name(name: &str) -> SargeResult<()> {
    if DEPLOYMENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(SargeError::Config(format!("invalid deployment name `{name}`")))
    }
}

fn parse_deployment(path: &Path) -> SargeResult<DeploymentConfig> {
    let text = fs::read_to_string(path).at(path)?;
    let config: DeploymentConfig =
        serde_yaml_bw::from_str(&text).map_err(|e| SargeError::InvalidDescriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    validate_deployment_name(&config.name).map_err(|_| SargeError::InvalidDescriptor {
        path: path.to_path_buf(),
        reason: format!("invalid deployment name `{}`", config.name),
    })?;
    if config.command.is_some() && !config.programs.is_empty() {
        return Err(SargeError::InvalidDescriptor {
            path: path.to_path_buf(),
            reason: "`command` and `programs` are mutually exclusive".into(),
        });
    }
    Ok(config)
}

/// Load every `etc/deployments/*.yaml`, sorted by file name.
pub fn load_deployments(layout: &HomeLayout) -> SargeResult<Vec<DeploymentConfig>> {
    let dir = layout.deployments_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
        .at(&dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| matches!(p.extension().and_then(|s| s.to_str()), Some("yaml" | "yml")))
        .collect();
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let config = parse_deployment(&path)?;
        if !seen.insert(config.name.clone()) {
            return Err(SargeError::InvalidDescriptor {
                path,
                reason: format!("duplicate deployment name `{}`", config.name),
            });
        }
        if path.file_stem().and_then(|s| s.to_str()) != Some(config.name.as_str()) {
            warn!(path = %path.display(), deployment = %config.name, "descriptor file name differs from deployment name");
        }
        configs.push(config);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn home() -> (tempfile::TempDir, HomeLayout) {
        let dir = tempdir().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure().unwrap();
        (dir, layout)
    }

    #[test]
    fn defaults_when_config_missing() {
        let (_dir, layout) = home();
        let config = SargeConfig::load(&layout).unwrap();
        assert_eq!(config, SargeConfig::default());
        assert_eq!(config.plugins, vec!["services", "folders", "listen"]);
        assert_eq!(config.scratch_root(&layout), layout.tmp_dir());
    }

    #[test]
    fn env_file_merges_without_overriding_yaml() {
        let (_dir, layout) = home();
        fs::write(
            layout.main_config(),
            "id_strategy: counter\nport_map:\n  web: 8080\nenviron:\n  MODE: yaml\n",
        )
        .unwrap();
        fs::write(layout.env_file(), "MODE=dotenv\nSENTRY_DSN=https://x@y/1\n").unwrap();

        let config = SargeConfig::load(&layout).unwrap();
        assert_eq!(config.id_strategy, IdStrategy::Counter);
        assert_eq!(config.stable_port("web"), Some(8080));
        assert_eq!(config.environ["MODE"], "yaml");
        assert_eq!(config.environ["SENTRY_DSN"], "https://x@y/1");
    }

    #[test]
    fn deployments_must_have_unique_names() {
        let (_dir, layout) = home();
        let dir = layout.deployments_dir();
        fs::write(dir.join("blog.yaml"), "name: blog\ncommand: ./serve\n").unwrap();
        fs::write(dir.join("blog2.yaml"), "name: blog\ncommand: ./serve\n").unwrap();

        let err = load_deployments(&layout).unwrap_err();
        assert!(err.to_string().contains("duplicate deployment name `blog`"));
    }

    #[test]
    fn command_and_programs_conflict() {
        let (_dir, layout) = home();
        fs::write(
            layout.deployments_dir().join("blog.yaml"),
            "name: blog\ncommand: ./serve\nprograms:\n  - { name: worker, command: ./work }\n",
        )
        .unwrap();
        assert!(matches!(
            load_deployments(&layout),
            Err(SargeError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_deployment_name("blog-2").is_ok());
        assert!(validate_deployment_name("../etc").is_err());
        assert!(validate_deployment_name("").is_err());
    }
}
