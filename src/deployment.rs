//! Versioned deployments and the activation protocol.
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use handlebars::{Handlebars, no_escape};
use sarge_plugin::{
    APPCFG_ENV, ActivationContext, AppDescriptor, DeploymentConfig, Event, EventBus, Program,
    QUICK_WSGI_SOCKET, Target, TargetKind,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    error::{IoResultExt, SargeError, SargeResult},
    fs_ops::{chown_to_user, remove_dir_if_exists, remove_file_if_exists, replace_symlink, write_atomic},
    layout::HomeLayout,
    registry::MAX_ATTEMPTS,
    supervisor::{GroupAction, GroupSpec, Supervisor},
};

pub const APPCFG_FILE: &str = "appcfg.json";
pub const QUICK_WSGI_LAUNCHER: &str = "quickapp.py";
pub const QUICK_WSGI_PROGRAM: &str = "wsgi";
/// Copy of the group fragment kept next to the runtime artifacts.
pub const RUN_FRAGMENT: &str = "supervisor.conf";

const LAUNCHER_TEMPLATE: &str = r#"# generated by sarge
import os, sys
sys.path.insert(0, {{version}})
os.chdir({{version}})
from flup.server.fcgi import WSGIServer
from {{module}} import {{attribute}} as application
WSGIServer(application, bindAddress={{socket}}, umask=0).run()
"#;

/// State of a deployment as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    NoVersion,
    /// Versions exist but none was ever activated.
    VersionCreated { latest: PathBuf },
    Active { run_folder: PathBuf },
}

/// `<n>.run` next to version folder `<n>`.
pub fn run_folder_of(version: &Path) -> PathBuf {
    sibling(version, "run")
}

/// `<n>.cfg` next to version folder `<n>`.
pub fn cfg_folder_of(version: &Path) -> PathBuf {
    sibling(version, "cfg")
}

fn sibling(version: &Path, suffix: &str) -> PathBuf {
    let name = version
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    version.with_file_name(format!("{name}.{suffix}"))
}

pub struct Deployment {
    config: DeploymentConfig,
    layout: HomeLayout,
    supervisor: Arc<Supervisor>,
    python: String,
    environ: BTreeMap<String, String>,
}

impl Deployment {
    pub fn new(
        config: DeploymentConfig,
        layout: HomeLayout,
        supervisor: Arc<Supervisor>,
        python: String,
        environ: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config,
            layout,
            supervisor,
            python,
            environ,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn folder(&self) -> PathBuf {
        self.layout.deployment_folder(&self.config.name)
    }

    pub fn active_link(&self) -> PathBuf {
        self.layout.active_link(&self.config.name)
    }

    /// Numbered version folders, ascending.
    pub fn versions(&self) -> SargeResult<Vec<(u64, PathBuf)>> {
        let folder = self.folder();
        let entries = match fs::read_dir(&folder) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SargeError::Io { path: folder, source: e }),
        };
        let mut versions: Vec<(u64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let n = e.file_name().to_str()?.parse::<u64>().ok()?;
                Some((n, e.path()))
            })
            .collect();
        versions.sort_by_key(|(n, _)| *n);
        Ok(versions)
    }

    /// Create the next numbered version folder.
    ///
    /// Numbers are never reused, even when a lower one was deleted.
    pub fn new_version(&self) -> SargeResult<PathBuf> {
        let folder = self.folder();
        fs::create_dir_all(&folder).at(&folder)?;

        let mut next = self.versions()?.last().map(|(n, _)| n + 1).unwrap_or(1);
        for _ in 0..MAX_ATTEMPTS {
            let path = folder.join(next.to_string());
            match fs::create_dir(&path) {
                Ok(()) => {
                    if let Some(user) = &self.config.user {
                        chown_to_user(&path, user)?;
                    }
                    info!(deployment = %self.name(), version = next, "version created");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(deployment = %self.name(), version = next, "version taken, trying next");
                    let newest = self.versions()?.last().map(|(n, _)| *n).unwrap_or(next);
                    next = newest.max(next) + 1;
                }
                Err(e) => return Err(SargeError::Io { path, source: e }),
            }
        }
        Err(SargeError::IdSpaceExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    pub fn state(&self) -> SargeResult<DeploymentState> {
        if let Ok(run_folder) = fs::read_link(self.active_link()) {
            return Ok(DeploymentState::Active { run_folder });
        }
        Ok(match self.versions()?.pop() {
            Some((_, latest)) => DeploymentState::VersionCreated { latest },
            None => DeploymentState::NoVersion,
        })
    }

    fn target(&self, version: &Path, run_folder: &Path) -> SargeResult<Target> {
        let mut services = self.config.require_services.clone();
        if let Some(descriptor) = AppDescriptor::load(version)? {
            services.extend(descriptor.require_services);
        }
        Ok(Target {
            kind: TargetKind::Deployment,
            name: self.config.name.clone(),
            app_name: self.config.name.clone(),
            folder: version.to_path_buf(),
            run_folder: run_folder.to_path_buf(),
            services,
        })
    }

    fn seed_context(&self, version: &Path) -> ActivationContext {
        let programs = self
            .config
            .program_specs()
            .into_iter()
            .map(|spec| Program::new(spec.name, spec.command).with_directory(version))
            .collect();
        let mut context = ActivationContext::new(programs);
        for (key, value) in self.environ.iter().chain(self.config.environ.iter()) {
            context.export(key.clone(), value.clone());
        }
        context
    }

    /// Whether `version` (canonical) is a numbered folder of this deployment.
    fn owns_version(&self, version: &Path) -> bool {
        let numbered = version
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.parse::<u64>().is_ok());
        let parent_matches = match (version.parent(), self.folder().canonicalize()) {
            (Some(parent), Ok(folder)) => parent == folder,
            _ => false,
        };
        numbered && parent_matches
    }

    fn wrap(&self, version: &Path, source: SargeError) -> SargeError {
        SargeError::Deploy {
            name: self.config.name.clone(),
            instance: None,
            version: Some(version.to_path_buf()),
            source: Box::new(source),
        }
    }

    /// Make `version` the live version of this deployment.
    ///
    /// 1. create `<n>.run` and `<n>.cfg` (at most one activation per version)
    /// 2. run the `ActivateVersion` pipeline over a fresh context
    /// 3. add the quick WSGI launcher when configured
    /// 4. write the AppConfig artifact and the group fragment copy
    /// 5. swap the active pointer to the run folder (commit point)
    /// 6. install the fragment, update and restart the group
    /// 7. publish `VersionActivated`
    ///
    /// A failure before step 5 removes the run and config folders and leaves
    /// the previous pointer untouched.
    pub fn activate_version(&self, bus: &EventBus, version: &Path) -> SargeResult<PathBuf> {
        if !version.is_dir() {
            return Err(self.wrap(
                version,
                SargeError::not_found("version", version.display().to_string()),
            ));
        }
        let version = version.canonicalize().at(version)?;
        if !self.owns_version(&version) {
            return Err(self.wrap(
                &version,
                SargeError::not_found("version", version.display().to_string()),
            ));
        }
        let run_folder = run_folder_of(&version);
        let cfg_folder = cfg_folder_of(&version);

        let mut created: Vec<&Path> = Vec::with_capacity(2);
        for dir in [&run_folder, &cfg_folder] {
            let failure = match fs::create_dir(dir) {
                Ok(()) => {
                    created.push(dir);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    SargeError::AlreadyActivated { path: version.clone() }
                }
                Err(e) => SargeError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                },
            };
            for dir in created {
                if let Err(cleanup) = remove_dir_if_exists(dir) {
                    warn!(path = %dir.display(), error = %cleanup, "could not remove partial activation");
                }
            }
            return Err(self.wrap(&version, failure));
        }

        let (target, context, fragment) = match self.prepare(bus, &version, &run_folder, &cfg_folder) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(deployment = %self.name(), version = %version.display(), error = %e, "activation failed");
                for dir in [&run_folder, &cfg_folder] {
                    if let Err(cleanup) = remove_dir_if_exists(dir) {
                        warn!(path = %dir.display(), error = %cleanup, "could not remove partial activation");
                    }
                }
                return Err(self.wrap(&version, e));
            }
        };

        replace_symlink(&run_folder, &self.active_link()).map_err(|e| self.wrap(&version, e))?;
        info!(deployment = %self.name(), run = %run_folder.display(), "active pointer switched");

        self.go_live(bus, &target, &context, &fragment)
            .map_err(|e| self.wrap(&version, e))?;
        Ok(run_folder)
    }

    fn prepare(
        &self,
        bus: &EventBus,
        version: &Path,
        run_folder: &Path,
        cfg_folder: &Path,
    ) -> SargeResult<(Target, ActivationContext, String)> {
        let target = self.target(version, run_folder)?;
        let mut context = self.seed_context(version);

        bus.publish(&mut Event::ActivateVersion {
            target: &target,
            context: &mut context,
        })?;

        if let Some(app) = &self.config.quick_wsgi_app {
            let program = self.quick_wsgi_program(app, version, run_folder)?;
            context.programs.insert(0, program);
        }

        let appcfg = cfg_folder.join(APPCFG_FILE);
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

        let log_dir = self.layout.log_dir();
        let fragment = self.supervisor.render_group(&GroupSpec {
            name: self.name(),
            programs: &context.programs,
            directory: version,
            log_dir: &log_dir,
            user: self.config.user.as_deref(),
            autorestart: self.config.autorestart,
        })?;
        write_atomic(&run_folder.join(RUN_FRAGMENT), fragment.as_bytes())?;
        Ok((target, context, fragment))
    }

    fn go_live(
        &self,
        bus: &EventBus,
        target: &Target,
        context: &ActivationContext,
        fragment: &str,
    ) -> SargeResult<()> {
        self.supervisor.apply_config(self.name(), fragment)?;
        self.supervisor.update()?;
        if !context.programs.is_empty() {
            self.supervisor.control_group(self.name(), GroupAction::Restart)?;
        }
        bus.publish(&mut Event::VersionActivated { target, context })?;
        info!(deployment = %self.name(), programs = context.programs.len(), "version activated");
        Ok(())
    }

    fn quick_wsgi_program(&self, app: &str, version: &Path, run_folder: &Path) -> SargeResult<Program> {
        let (module, attribute) = app.split_once(':').unwrap_or((app, "application"));
        let socket = run_folder.join(QUICK_WSGI_SOCKET);
        let mut templates = Handlebars::new();
        templates.register_escape_fn(no_escape);
        // Paths are emitted as Python string literals.
        let data = json!({
            "version": serde_json::to_string(&version.display().to_string())?,
            "socket": serde_json::to_string(&socket.display().to_string())?,
            "module": module,
            "attribute": attribute,
        });
        let script = templates
            .render_template(LAUNCHER_TEMPLATE, &data)
            .map_err(|e| SargeError::Template(e.to_string()))?;
        let launcher = run_folder.join(QUICK_WSGI_LAUNCHER);
        write_atomic(&launcher, script.as_bytes())?;
        Ok(Program::new(
            QUICK_WSGI_PROGRAM,
            format!("{} {}", self.python, launcher.display()),
        )
        .with_directory(version))
    }

    pub fn start(&self) -> SargeResult<()> {
        self.supervisor.control_group(self.name(), GroupAction::Start)
    }

    pub fn stop(&self) -> SargeResult<()> {
        self.supervisor.control_group(self.name(), GroupAction::Stop)
    }

    /// Remove the deployment entirely: programs, pointer and every version.
    ///
    /// Plugin failures on `WillDestroy` are logged and do not stop the removal.
    pub fn destroy(&self, bus: &EventBus) -> SargeResult<()> {
        let folder = self.folder();
        let run_folder = fs::read_link(self.active_link()).unwrap_or_else(|_| folder.clone());
        let target = Target {
            kind: TargetKind::Deployment,
            name: self.config.name.clone(),
            app_name: self.config.name.clone(),
            folder: folder.clone(),
            run_folder,
            services: self.config.require_services.clone(),
        };
        if let Err(e) = bus.publish(&mut Event::WillDestroy { target: &target }) {
            warn!(deployment = %self.name(), error = %e, "plugin failed during destroy");
        }
        self.supervisor.remove_group(self.name())?;
        remove_file_if_exists(&self.active_link())?;
        remove_dir_if_exists(&folder)?;
        info!(deployment = %self.name(), "deployment destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sarge_plugin::{CommandOutput, CommandRunner, PluginError};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl CommandRunner for Recorder {
        fn run(&self, argv: &[String], _cwd: Option<&Path>) -> Result<CommandOutput, PluginError> {
            self.0.lock().unwrap().push(argv.join(" "));
            Ok(CommandOutput::ok())
        }
    }

    fn deployment(config: DeploymentConfig) -> (tempfile::TempDir, Arc<Recorder>, Deployment) {
        let dir = tempdir().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure().unwrap();
        let runner = Arc::new(Recorder::default());
        let supervisor = Arc::new(
            Supervisor::new(layout.clone(), vec!["supervisorctl".into()], runner.clone()).unwrap(),
        );
        let d = Deployment::new(config, layout, supervisor, "python3".into(), BTreeMap::new());
        (dir, runner, d)
    }

    #[test]
    fn version_numbers_are_never_reused() {
        let (_dir, _, d) = deployment(DeploymentConfig::new("blog"));
        assert_eq!(d.state().unwrap(), DeploymentState::NoVersion);

        let v1 = d.new_version().unwrap();
        let v2 = d.new_version().unwrap();
        assert!(v1.ends_with("blog.deploy/1"));
        assert!(v2.ends_with("blog.deploy/2"));

        fs::remove_dir(&v1).unwrap();
        let v3 = d.new_version().unwrap();
        assert!(v3.ends_with("blog.deploy/3"));
        assert_eq!(
            d.state().unwrap(),
            DeploymentState::VersionCreated { latest: v3 }
        );
    }

    #[test]
    fn activation_commits_and_restarts_group() {
        let mut config = DeploymentConfig::new("blog");
        config.command = Some("./serve".into());
        let (_dir, runner, d) = deployment(config);
        let bus = EventBus::new();

        let version = d.new_version().unwrap();
        let run = d.activate_version(&bus, &version).unwrap();

        assert_eq!(fs::read_link(d.active_link()).unwrap(), run);
        let version = version.canonicalize().unwrap();
        assert!(cfg_folder_of(&version).join(APPCFG_FILE).is_file());
        assert!(run.join(RUN_FRAGMENT).is_file());

        let calls = runner.0.lock().unwrap();
        assert!(calls.iter().any(|c| c.ends_with("restart blog:*")));
    }

    #[test]
    fn second_activation_of_same_version_is_refused() {
        let (_dir, _, d) = deployment(DeploymentConfig::new("blog"));
        let bus = EventBus::new();
        let version = d.new_version().unwrap();
        d.activate_version(&bus, &version).unwrap();

        match d.activate_version(&bus, &version) {
            Err(SargeError::Deploy { name, source, .. }) => {
                assert_eq!(name, "blog");
                assert!(matches!(*source, SargeError::AlreadyActivated { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stale_config_folder_leaves_no_run_folder() {
        let (_dir, _, d) = deployment(DeploymentConfig::new("blog"));
        let version = d.new_version().unwrap();
        let version = version.canonicalize().unwrap();
        fs::create_dir(cfg_folder_of(&version)).unwrap();

        match d.activate_version(&EventBus::new(), &version) {
            Err(SargeError::Deploy { source, .. }) => {
                assert!(matches!(*source, SargeError::AlreadyActivated { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!run_folder_of(&version).exists());
        assert!(fs::symlink_metadata(d.active_link()).is_err());
    }

    #[test]
    fn only_numbered_children_can_be_activated() {
        let (_dir, _, d) = deployment(DeploymentConfig::new("blog"));
        d.new_version().unwrap();
        let scratch = d.folder().join("scratch");
        fs::create_dir(&scratch).unwrap();

        match d.activate_version(&EventBus::new(), &scratch) {
            Err(SargeError::Deploy { source, .. }) => {
                assert!(matches!(*source, SargeError::NotFound { kind: "version", .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!d.folder().join("scratch.run").exists());
        assert!(fs::symlink_metadata(d.active_link()).is_err());
    }

    #[test]
    fn quick_wsgi_program_comes_first() {
        let mut config = DeploymentConfig::new("blog");
        config.quick_wsgi_app = Some("blog.wsgi:app".into());
        config.programs.push(sarge_plugin::ProgramSpec {
            name: "worker".into(),
            command: "./work".into(),
        });
        let (_dir, _, d) = deployment(config);
        let version = d.new_version().unwrap();
        let run = d.activate_version(&EventBus::new(), &version).unwrap();

        let fragment = fs::read_to_string(run.join(RUN_FRAGMENT)).unwrap();
        assert!(fragment.contains("programs = blog_wsgi,blog_worker"));
        let launcher = fs::read_to_string(run.join(QUICK_WSGI_LAUNCHER)).unwrap();
        assert!(launcher.contains("from blog.wsgi import app as application"));
        assert!(launcher.contains(QUICK_WSGI_SOCKET));
    }

    #[test]
    fn destroy_removes_everything() {
        let (_dir, _, d) = deployment(DeploymentConfig::new("blog"));
        let bus = EventBus::new();
        let version = d.new_version().unwrap();
        d.activate_version(&bus, &version).unwrap();

        d.destroy(&bus).unwrap();
        assert!(!d.folder().exists());
        assert!(fs::symlink_metadata(d.active_link()).is_err());
        assert_eq!(d.state().unwrap(), DeploymentState::NoVersion);
    }
}
