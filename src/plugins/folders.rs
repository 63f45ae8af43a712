//! Provisions `scratch-folder` and `persistent-folder` services.
//!
//! Scratch folders are wiped and recreated on every activation; persistent
//! folders are keyed by application and service name and survive.
use std::{fs, io, path::PathBuf, sync::Arc};

use sarge_plugin::{Event, PluginError, PluginRegistrar, Signal};
use tracing::info;

use super::PluginHost;

pub const SCRATCH: &str = "scratch-folder";
pub const PERSISTENT: &str = "persistent-folder";

fn recreate(path: &PathBuf) -> Result<(), PluginError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(PluginError::io(path, e)),
    }
    fs::create_dir_all(path).map_err(|e| PluginError::io(path, e))
}

pub fn register(host: &Arc<PluginHost>, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
    let scratch_root = host.config.scratch_root(&host.layout);
    let persistent_root = host.config.persistent_root(&host.layout);

    let handler = move |event: &mut Event<'_>| -> Result<(), PluginError> {
        let (Event::ActivateVersion { target, context } | Event::WillStart { target, context }) = event
        else {
            return Ok(());
        };
        for service in target.services_of_kind(SCRATCH) {
            let path = scratch_root.join(&target.app_name).join(&service.name);
            recreate(&path)?;
            info!(app = %target.app_name, service = %service.name, path = %path.display(), "scratch folder recreated");
            context.set_service(service.name.clone(), path.display().to_string());
        }
        for service in target.services_of_kind(PERSISTENT) {
            let path = persistent_root.join(&target.app_name).join(&service.name);
            fs::create_dir_all(&path).map_err(|e| PluginError::io(&path, e))?;
            info!(app = %target.app_name, service = %service.name, path = %path.display(), "folder provisioned");
            context.set_service(service.name.clone(), path.display().to_string());
        }
        Ok(())
    };
    let handler = Arc::new(handler);
    registrar.on(Signal::ActivateVersion, handler.clone());
    registrar.on(Signal::WillStart, handler);
    Ok(())
}
