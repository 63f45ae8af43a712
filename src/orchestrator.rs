//! Top-level object built once per CLI invocation.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use sarge_plugin::{CommandRunner, Event, EventBus, PluginError, PluginRegistrar, SystemCommandRunner};
use tracing::{debug, info, warn};

use crate::{
    config::{SargeConfig, load_deployments},
    deployment::{Deployment, DeploymentState},
    error::{IoResultExt, SargeError, SargeResult},
    fs_ops::{remove_dir_if_exists, write_atomic},
    instance::{APPLICATION_NAME, Instance, PROCESS},
    layout::HomeLayout,
    plugins::{self, PluginHost},
    registry::Registry,
    supervisor::Supervisor,
};

pub struct Sarge {
    host: Arc<PluginHost>,
    bus: EventBus,
    supervisor: Arc<Supervisor>,
    registry: Registry,
    deployments: Vec<Deployment>,
}

impl Sarge {
    pub fn open<P: Into<PathBuf>>(home: P) -> SargeResult<Self> {
        Self::with_runner(home, Arc::new(SystemCommandRunner))
    }

    /// Build the orchestrator with a custom command runner for every external
    /// tool (supervisorctl, reload commands, tar).
    pub fn with_runner<P: Into<PathBuf>>(home: P, runner: Arc<dyn CommandRunner>) -> SargeResult<Self> {
        // 1) layout
        let layout = HomeLayout::new(home);
        layout.ensure()?;

        // 2) configuration and deployments
        let config = SargeConfig::load(&layout)?;
        let supervisor = Arc::new(Supervisor::new(
            layout.clone(),
            config.supervisorctl.clone(),
            runner.clone(),
        )?);
        let registry = Registry::new(layout.clone(), config.id_strategy);
        let deployments = load_deployments(&layout)?
            .into_iter()
            .map(|cfg| {
                Deployment::new(
                    cfg,
                    layout.clone(),
                    supervisor.clone(),
                    config.python.clone(),
                    config.environ.clone(),
                )
            })
            .collect();

        let plugin_ids = config.plugins.clone();
        let mut sarge = Self {
            host: Arc::new(PluginHost {
                layout,
                config,
                runner,
            }),
            bus: EventBus::new(),
            supervisor,
            registry,
            deployments,
        };

        // 3) plugins, in configured order
        for id in &plugin_ids {
            let factory = plugins::builtin(id)
                .ok_or_else(|| SargeError::Config(format!("unknown plugin `{id}`")))?;
            sarge.load_plugin(id, factory)?;
        }
        sarge.bus.publish(&mut Event::PreInit)?;
        debug!(home = %sarge.layout().root().display(), plugins = ?plugin_ids, "orchestrator ready");
        Ok(sarge)
    }

    /// Invoke a plugin factory once so it can subscribe to the bus.
    pub fn load_plugin<F>(&mut self, id: &str, factory: F) -> SargeResult<()>
    where
        F: FnOnce(&Arc<PluginHost>, &mut PluginRegistrar<'_>) -> Result<(), PluginError>,
    {
        let mut registrar = PluginRegistrar::new(id, &mut self.bus);
        factory(&self.host, &mut registrar)?;
        debug!(plugin = id, "plugin loaded");
        Ok(())
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.host.layout
    }

    pub fn config(&self) -> &SargeConfig {
        &self.host.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.host.runner
    }

    /// Write the supervisor main config and, when absent, a default `sarge.yaml`.
    pub fn init(&self) -> SargeResult<()> {
        self.layout().ensure()?;
        self.supervisor.write_main_config()?;
        let main = self.layout().main_config();
        if !main.exists() {
            write_atomic(&main, self.config().to_yaml()?.as_bytes())?;
            info!(path = %main.display(), "default configuration written");
        }
        Ok(())
    }

    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    pub fn deployment(&self, name: &str) -> SargeResult<&Deployment> {
        self.deployments
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| SargeError::not_found("deployment", name))
    }

    pub fn new_version(&self, name: &str) -> SargeResult<PathBuf> {
        self.deployment(name)?.new_version()
    }

    pub fn activate_version(&self, name: &str, version: &Path) -> SargeResult<PathBuf> {
        self.deployment(name)?.activate_version(&self.bus, version)
    }

    pub fn start(&self, name: &str) -> SargeResult<()> {
        self.deployment(name)?.start()
    }

    pub fn stop(&self, name: &str) -> SargeResult<()> {
        self.deployment(name)?.stop()
    }

    pub fn destroy_deployment(&self, name: &str) -> SargeResult<()> {
        self.deployment(name)?.destroy(&self.bus)
    }

    pub fn deployment_states(&self) -> SargeResult<Vec<(String, DeploymentState)>> {
        self.deployments
            .iter()
            .map(|d| Ok((d.name().to_string(), d.state()?)))
            .collect()
    }

    pub fn new_bucket(&self, meta: BTreeMap<String, String>) -> SargeResult<Instance> {
        self.registry.create(meta)
    }

    /// Look up an instance by id, or `"newest"`.
    pub fn get_bucket(&self, id: &str) -> SargeResult<Instance> {
        self.registry.get(id)
    }

    pub fn list_buckets(&self) -> SargeResult<Vec<Instance>> {
        self.registry.list()
    }

    /// Start an existing instance again, rerunning the `WillStart` plugins.
    pub fn start_bucket(&self, id: &str) -> SargeResult<Instance> {
        let instance = self.get_bucket(id)?;
        instance.start(self)?;
        Ok(instance)
    }

    /// Stop an instance's programs and tell plugins through `HasStopped`.
    pub fn stop_bucket(&self, id: &str) -> SargeResult<Instance> {
        let instance = self.get_bucket(id)?;
        instance.stop(self)?;
        Ok(instance)
    }

    /// Remove an instance: programs, folder tree and registry entry.
    ///
    /// Plugin failures on `WillDestroy` are logged and do not stop the removal.
    pub fn destroy(&self, id: &str) -> SargeResult<()> {
        let instance = self.get_bucket(id)?;
        match instance.target() {
            Ok(target) => {
                if let Err(e) = self.bus.publish(&mut Event::WillDestroy { target: &target }) {
                    warn!(instance = %instance.id, error = %e, "plugin failed during destroy");
                }
            }
            Err(e) => warn!(instance = %instance.id, error = %e, "could not describe instance"),
        }
        self.supervisor.remove_group(&instance.id)?;
        remove_dir_if_exists(&instance.folder)?;
        self.registry.remove(&instance.id)?;
        info!(instance = %instance.id, "instance destroyed");
        Ok(())
    }

    /// Create an instance from `tarball`, configure and start it.
    ///
    /// Any failure after the instance exists is returned as
    /// [`SargeError::Deploy`] carrying the instance, so the caller can destroy it.
    pub fn deploy(
        &self,
        tarball: &Path,
        process: Option<&str>,
        mut meta: BTreeMap<String, String>,
    ) -> SargeResult<Instance> {
        let tarball = tarball.canonicalize().at(tarball)?;
        if let Some(process) = process {
            meta.insert(PROCESS.to_string(), process.to_string());
        }
        let app_name = meta
            .get(APPLICATION_NAME)
            .cloned()
            .unwrap_or_else(|| tarball_stem(&tarball));
        meta.entry(APPLICATION_NAME.to_string())
            .or_insert_with(|| app_name.clone());

        let instance = self.new_bucket(meta)?;
        match self.provision(&instance, &tarball) {
            Ok(()) => {
                info!(instance = %instance.id, app = %app_name, "deployed");
                Ok(instance)
            }
            Err(e) => Err(SargeError::deploy(app_name, e).with_instance(instance)),
        }
    }

    fn provision(&self, instance: &Instance, tarball: &Path) -> SargeResult<()> {
        let argv = vec![
            "tar".to_string(),
            "-xf".to_string(),
            tarball.display().to_string(),
            "-C".to_string(),
            instance.folder.display().to_string(),
        ];
        self.runner().check(&argv, None)?;
        instance.configure(self)?;
        instance.start(self)
    }

    pub fn status(&self) -> SargeResult<String> {
        self.supervisor.status()
    }
}

/// `blog-1.2.tar.gz` becomes `blog-1.2`.
fn tarball_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for suffix in [".tar.gz", ".tgz", ".tar.bz2", ".tar.xz", ".tar"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarball_names() {
        assert_eq!(tarball_stem(Path::new("/tmp/blog-1.2.tar.gz")), "blog-1.2");
        assert_eq!(tarball_stem(Path::new("shop.tgz")), "shop");
        assert_eq!(tarball_stem(Path::new("raw")), "raw");
    }
}
