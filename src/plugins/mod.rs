//! Built-in plugins. Each is a plain bus consumer with no special access to
//! the core; the orchestrator instantiates them by id from `etc/sarge.yaml`.
use std::{path::Path, sync::Arc};

use handlebars::{Handlebars, no_escape};
use sarge_plugin::{CommandRunner, PluginError, PluginRegistrar};
use serde::Serialize;
use tracing::debug;

use crate::{config::SargeConfig, error::SargeError, fs_ops::write_atomic, layout::HomeLayout};

pub mod folders;
pub mod lb;
pub mod listen;
pub mod services;
pub mod vhost;

/// What a plugin may see of the orchestrator.
pub struct PluginHost {
    pub layout: HomeLayout,
    pub config: SargeConfig,
    pub runner: Arc<dyn CommandRunner>,
}

impl PluginHost {
    /// Run a configured reload command; nothing to do when none is configured.
    pub fn reload(&self, what: &str, argv: Option<&Vec<String>>) -> Result<(), PluginError> {
        match argv {
            Some(argv) if !argv.is_empty() => {
                self.runner.check(argv, None)?;
                debug!(what, "reloaded");
            }
            _ => debug!(what, "no reload command configured"),
        }
        Ok(())
    }
}

/// Called once at load time; subscribes the plugin's handlers.
pub type PluginFactory = fn(&Arc<PluginHost>, &mut PluginRegistrar<'_>) -> Result<(), PluginError>;

pub const BUILTIN: [&str; 5] = ["services", "folders", "listen", "vhost", "lb"];

pub fn builtin(id: &str) -> Option<PluginFactory> {
    let factory: PluginFactory = match id {
        "services" => services::register,
        "folders" => folders::register,
        "listen" => listen::register,
        "vhost" => vhost::register,
        "lb" => lb::register,
        _ => return None,
    };
    Some(factory)
}

pub(crate) fn render<T: Serialize>(template: &str, data: &T) -> Result<String, PluginError> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(no_escape);
    hb.render_template(template, data)
        .map_err(|e| PluginError::Template(e.to_string()))
}

/// [`write_atomic`] for plugin handlers: readers never see a half-written file.
pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<(), PluginError> {
    write_atomic(path, contents).map_err(|e| match e {
        SargeError::Io { path, source } => PluginError::Io { path, source },
        other => PluginError::Other(other.to_string()),
    })
}
