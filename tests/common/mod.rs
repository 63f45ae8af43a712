#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use sarge::Sarge;
use sarge_plugin::{CommandOutput, CommandRunner, PluginError, SystemCommandRunner};
use tempfile::{TempDir, tempdir};

/// Records every command instead of running it. Programs listed in
/// `passthrough` really run; commands containing a `fail_on` pattern exit 1.
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<String>>,
    pub passthrough: Vec<String>,
}

impl RecordingRunner {
    pub fn with_passthrough(programs: &[&str]) -> Self {
        Self {
            passthrough: programs.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn fail_when(&self, pattern: &str) {
        self.fail_on.lock().unwrap().push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String], cwd: Option<&Path>) -> Result<CommandOutput, PluginError> {
        let line = argv.join(" ");
        self.calls.lock().unwrap().push(line.clone());
        if self.fail_on.lock().unwrap().iter().any(|p| line.contains(p.as_str())) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("simulated failure: {line}"),
            });
        }
        if argv.first().is_some_and(|p| self.passthrough.contains(p)) {
            return SystemCommandRunner.run(argv, cwd);
        }
        Ok(CommandOutput::ok())
    }
}

/// A temporary home with the given main config and deployment descriptors.
pub fn home(main_config: &str, deployments: &[(&str, &str)]) -> TempDir {
    let dir = tempdir().unwrap();
    let etc = dir.path().join("etc");
    fs::create_dir_all(etc.join("deployments")).unwrap();
    fs::write(etc.join("sarge.yaml"), main_config).unwrap();
    for (name, yaml) in deployments {
        fs::write(etc.join("deployments").join(format!("{name}.yaml")), yaml).unwrap();
    }
    dir
}

pub fn open(home: &TempDir, runner: &Arc<RecordingRunner>) -> Sarge {
    Sarge::with_runner(home.path(), runner.clone()).unwrap()
}
