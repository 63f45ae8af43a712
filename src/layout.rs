//! On-disk layout of an orchestrator home.
use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::{IoResultExt, SargeResult};

pub const MAIN_CONFIG: &str = "sarge.yaml";
pub const ENV_FILE: &str = "sarge.env";
pub const SUPERVISOR_CONFIG: &str = "supervisord.conf";
pub const DEPLOY_SUFFIX: &str = ".deploy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn etc(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn var(&self) -> PathBuf {
        self.root.join("var")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.var().join("log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.var().join("run")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.var().join("tmp")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.var().join("data")
    }

    pub fn lb_dir(&self) -> PathBuf {
        self.var().join("lb")
    }

    pub fn deploy_root(&self) -> PathBuf {
        self.root.join("deploy")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn main_config(&self) -> PathBuf {
        self.etc().join(MAIN_CONFIG)
    }

    pub fn env_file(&self) -> PathBuf {
        self.etc().join(ENV_FILE)
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.etc().join("deployments")
    }

    pub fn supervisor_config(&self) -> PathBuf {
        self.etc().join(SUPERVISOR_CONFIG)
    }

    pub fn supervisor_include_dir(&self) -> PathBuf {
        self.etc().join("supervisor.d")
    }

    pub fn nginx_dir(&self) -> PathBuf {
        self.etc().join("nginx.d")
    }

    pub fn haproxy_config(&self) -> PathBuf {
        self.etc().join("haproxy.cfg")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.var().join("instances.json")
    }

    pub fn registry_lock(&self) -> PathBuf {
        self.var().join("instances.lock")
    }

    pub fn counter_file(&self) -> PathBuf {
        self.var().join("counter")
    }

    pub fn counter_lock(&self) -> PathBuf {
        self.var().join("counter.lock")
    }

    /// `deploy/<name>.deploy`
    pub fn deployment_folder(&self, name: &str) -> PathBuf {
        self.deploy_root().join(format!("{name}{DEPLOY_SUFFIX}"))
    }

    /// `deploy/<id>`
    pub fn instance_folder(&self, id: &str) -> PathBuf {
        self.deploy_root().join(id)
    }

    /// `active/<name>`
    pub fn active_link(&self, name: &str) -> PathBuf {
        self.active_dir().join(name)
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.etc(),
            self.deployments_dir(),
            self.supervisor_include_dir(),
            self.nginx_dir(),
            self.var(),
            self.log_dir(),
            self.run_dir(),
            self.tmp_dir(),
            self.data_dir(),
            self.lb_dir(),
            self.deploy_root(),
            self.active_dir(),
        ]
    }

    /// Create every directory of the layout. Safe to call repeatedly.
    pub fn ensure(&self) -> SargeResult<()> {
        for dir in self.directories() {
            fs::create_dir_all(&dir).at(&dir)?;
            debug!(path = %dir.display(), "layout directory ready");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure().unwrap();
        layout.ensure().unwrap();

        for d in layout.directories() {
            assert!(d.is_dir(), "{} missing", d.display());
        }
    }

    #[test]
    fn deployment_paths() {
        let layout = HomeLayout::new("/srv/sarge");
        assert_eq!(
            layout.deployment_folder("blog"),
            PathBuf::from("/srv/sarge/deploy/blog.deploy")
        );
        assert_eq!(layout.active_link("blog"), PathBuf::from("/srv/sarge/active/blog"));
        assert_eq!(layout.instance_folder("x7k2pq"), PathBuf::from("/srv/sarge/deploy/x7k2pq"));
    }
}
