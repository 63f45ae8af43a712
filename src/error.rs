use std::{
    io,
    path::{Path, PathBuf},
};

use sarge_plugin::PluginError;
use thiserror::Error;

use crate::instance::Instance;

pub type SargeResult<T> = Result<T, SargeError>;

#[derive(Debug, Error)]
pub enum SargeError {
    /// Activation or provisioning failed. Carries what was partially created so
    /// the caller can compensate.
    #[error("deploying `{name}` failed: {source}")]
    Deploy {
        name: String,
        instance: Option<Box<Instance>>,
        version: Option<PathBuf>,
        #[source]
        source: Box<SargeError>,
    },

    #[error("supervisorctl {action} `{group}` failed: {detail}")]
    SupervisorControl {
        group: String,
        action: String,
        detail: String,
    },

    /// supervisord is not reachable at all.
    #[error("supervisord is not running (group `{group}`): {detail}")]
    SupervisorNotRunning { group: String, detail: String },

    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    /// Allocation kept colliding. Indicates a capacity or configuration bug and
    /// must abort the invocation.
    #[error("id space exhausted after {attempts} allocation attempts")]
    IdSpaceExhausted { attempts: usize },

    #[error("version {path} was already activated")]
    AlreadyActivated { path: PathBuf },

    #[error("invalid descriptor {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SargeError {
    pub fn not_found<I: Into<String>>(kind: &'static str, id: I) -> Self {
        SargeError::NotFound { kind, id: id.into() }
    }

    pub fn deploy<N: Into<String>>(name: N, source: SargeError) -> Self {
        SargeError::Deploy {
            name: name.into(),
            instance: None,
            version: None,
            source: Box::new(source),
        }
    }

    /// Attach the partially-created instance to a deploy error.
    pub fn with_instance(self, partial: Instance) -> Self {
        match self {
            SargeError::Deploy {
                name,
                version,
                source,
                ..
            } => SargeError::Deploy {
                name,
                instance: Some(Box::new(partial)),
                version,
                source,
            },
            other => SargeError::Deploy {
                name: partial.id.clone(),
                instance: Some(Box::new(partial)),
                version: None,
                source: Box::new(other),
            },
        }
    }

    /// Errors that must abort the invocation without compensating cleanup.
    pub fn is_fatal(&self) -> bool {
        match self {
            SargeError::IdSpaceExhausted { .. } => true,
            SargeError::Deploy { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> SargeResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> SargeResult<T> {
        self.map_err(|source| SargeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
