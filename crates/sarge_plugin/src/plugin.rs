use std::{
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;
use tracing::debug;

use crate::bus::Signal;

/// Errors a plugin (or the bus on its behalf) can return.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An external tool exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// A handler failed; raised by the bus so the caller knows who broke.
    #[error("plugin `{plugin}` failed on {signal}: {source}")]
    Handler {
        plugin: String,
        signal: Signal,
        #[source]
        source: Box<PluginError>,
    },

    #[error("plugin error: {0}")]
    Other(String),
}

impl PluginError {
    pub fn io<P: AsRef<Path>>(path: P, source: std::io::Error) -> Self {
        PluginError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for error messages.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Seam through which the core and plugins invoke external tools
/// (supervisorctl, nginx, load balancer reloads, tar).
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], cwd: Option<&Path>) -> Result<CommandOutput, PluginError>;

    /// Run and turn a non-zero exit into [`PluginError::Command`].
    fn check(&self, argv: &[String], cwd: Option<&Path>) -> Result<CommandOutput, PluginError> {
        let output = self.run(argv, cwd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(PluginError::Command {
                command: argv.join(" "),
                status: output
                    .code
                    .map(|c| format!("status {c}"))
                    .unwrap_or_else(|| "a signal".to_string()),
                stderr: output.combined(),
            })
        }
    }
}

/// Runs commands with `std::process::Command`, blocking until they exit.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, argv: &[String], cwd: Option<&Path>) -> Result<CommandOutput, PluginError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PluginError::Other("empty command line".to_string()))?;
        debug!(command = %argv.join(" "), "running");
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|e| PluginError::io(program, e))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
