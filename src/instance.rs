//! Registry-tracked instances ("buckets"), the version-less deployment flavor.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use sarge_plugin::{
    APPCFG_ENV, ActivationContext, AppConfig, AppDescriptor, Event, Program, Target, TargetKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{IoResultExt, SargeError, SargeResult},
    fs_ops::write_atomic,
    orchestrator::Sarge,
    procfile,
    supervisor::{GroupAction, GroupSpec},
};

/// Metadata key naming the application; bus filters match on it.
pub const APPLICATION_NAME: &str = "APPLICATION_NAME";
/// Metadata key holding a single command when there is no Procfile.
pub const COMMAND: &str = "COMMAND";
/// Metadata key restricting the instance to one Procfile process.
pub const PROCESS: &str = "PROCESS";

pub const APPCFG_FILE: &str = "appcfg.json";
pub const PROGRAMS_FILE: &str = "programs.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub meta: BTreeMap<String, String>,
    pub folder: PathBuf,
}

impl Instance {
    pub fn app_name(&self) -> &str {
        self.meta
            .get(APPLICATION_NAME)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }

    pub fn appcfg_path(&self) -> PathBuf {
        self.folder.join(APPCFG_FILE)
    }

    fn programs_path(&self) -> PathBuf {
        self.folder.join(PROGRAMS_FILE)
    }

    pub fn target(&self) -> SargeResult<Target> {
        let services = AppDescriptor::load(&self.folder)?
            .map(|d| d.require_services)
            .unwrap_or_default();
        Ok(Target {
            kind: TargetKind::Instance,
            name: self.id.clone(),
            app_name: self.app_name().to_string(),
            folder: self.folder.clone(),
            run_folder: self.folder.clone(),
            services,
        })
    }

    /// Programs declared by the instance: its Procfile, else its `COMMAND`.
    pub fn declared_programs(&self) -> SargeResult<Vec<Program>> {
        let mut programs = match procfile::load(&self.folder)? {
            Some(programs) => programs,
            None => self
                .meta
                .get(COMMAND)
                .map(|command| vec![Program::new(sarge_plugin::DEFAULT_PROGRAM, command.clone())])
                .unwrap_or_default(),
        };
        if let Some(process) = self.meta.get(PROCESS) {
            programs.retain(|p| &p.name == process);
            if programs.is_empty() {
                return Err(SargeError::not_found("process", format!("{}/{process}", self.id)));
            }
        }
        for program in &mut programs {
            program.directory.get_or_insert_with(|| self.folder.clone());
        }
        Ok(programs)
    }

    /// Assemble the program list through the `Configuring` pipeline and persist it.
    pub fn configure(&self, sarge: &Sarge) -> SargeResult<Vec<Program>> {
        let target = self.target()?;
        let mut programs = self.declared_programs()?;
        sarge.bus().publish(&mut Event::Configuring {
            target: &target,
            programs: &mut programs,
        })?;
        write_atomic(&self.programs_path(), &serde_json::to_vec_pretty(&programs)?)?;
        debug!(instance = %self.id, programs = programs.len(), "configured");
        Ok(programs)
    }

    /// The configured program list, configuring first when needed.
    pub fn programs(&self, sarge: &Sarge) -> SargeResult<Vec<Program>> {
        let path = self.programs_path();
        if path.is_file() {
            let text = fs::read_to_string(&path).at(&path)?;
            return Ok(serde_json::from_str(&text)?);
        }
        self.configure(sarge)
    }

    /// Run `WillStart`, write AppConfig and the fragment, then start the group.
    pub fn start(&self, sarge: &Sarge) -> SargeResult<()> {
        let target = self.target()?;
        let mut context = ActivationContext::new(self.programs(sarge)?);
        for (key, value) in &sarge.config().environ {
            context.export(key.clone(), value.clone());
        }
        sarge.bus().publish(&mut Event::WillStart {
            target: &target,
            context: &mut context,
        })?;

        let appcfg = self.appcfg_path();
        let appcfg_value = appcfg.display().to_string();
        let exports = context.app_config.environ.clone();
        for program in &mut context.programs {
            for (key, value) in &exports {
                program
                    .environment
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            program.environment.insert(APPCFG_ENV.to_string(), appcfg_value.clone());
        }
        write_atomic(&appcfg, context.app_config.to_json()?.as_bytes())?;

        let supervisor = sarge.supervisor();
        let log_dir = sarge.layout().log_dir();
        let fragment = supervisor.render_group(&GroupSpec {
            name: &self.id,
            programs: &context.programs,
            directory: &self.folder,
            log_dir: &log_dir,
            user: None,
            autorestart: sarge_plugin::AutoRestart::Never,
        })?;
        supervisor.apply_config(&self.id, &fragment)?;
        supervisor.update()?;
        supervisor.control_group(&self.id, GroupAction::Start)?;
        info!(instance = %self.id, app = %self.app_name(), "instance started");
        Ok(())
    }

    pub fn stop(&self, sarge: &Sarge) -> SargeResult<()> {
        sarge.supervisor().control_group(&self.id, GroupAction::Stop)?;
        let target = self.target()?;
        sarge.bus().publish(&mut Event::HasStopped { target: &target })?;
        info!(instance = %self.id, "instance stopped");
        Ok(())
    }

    /// Environment a process of this instance sees.
    pub fn environment(&self) -> SargeResult<BTreeMap<String, String>> {
        let appcfg = self.appcfg_path();
        let mut env = BTreeMap::new();
        if appcfg.is_file() {
            env.extend(AppConfig::read(&appcfg)?.environ);
        }
        env.insert(APPCFG_ENV.to_string(), appcfg.display().to_string());
        Ok(env)
    }

    /// Run `command` interactively inside the instance folder.
    ///
    /// Stdio is inherited; returns the exit code (1 when killed by a signal).
    pub fn run(&self, command: &[String]) -> SargeResult<i32> {
        let argv: Vec<String> = if command.is_empty() {
            vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
        } else {
            command.to_vec()
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SargeError::Config("empty command".into()))?;
        debug!(instance = %self.id, command = %argv.join(" "), "running in instance");
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.folder)
            .envs(self.environment()?)
            .status()
            .at(Path::new(program))?;
        Ok(status.code().unwrap_or(1))
    }
}
