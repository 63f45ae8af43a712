//! Copies the application descriptor's `services` into AppConfig.
use std::sync::Arc;

use sarge_plugin::{AppDescriptor, Event, PluginError, PluginRegistrar, Signal};
use tracing::debug;

use super::PluginHost;

fn contribute(event: &mut Event<'_>) -> Result<(), PluginError> {
    match event {
        Event::ActivateVersion { target, context } | Event::WillStart { target, context } => {
            let Some(descriptor) = AppDescriptor::load(&target.folder)? else {
                return Ok(());
            };
            for (name, value) in descriptor.services {
                debug!(app = %target.app_name, service = %name, "service exported");
                context.set_service(name, value);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn register(_host: &Arc<PluginHost>, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
    registrar.on_fn(Signal::ActivateVersion, contribute);
    registrar.on_fn(Signal::WillStart, contribute);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sarge_plugin::{ActivationContext, EventBus, Target, TargetKind};
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn descriptor_services_land_in_app_config() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("sargeapp.yaml"),
            "services:\n  cache: { host: localhost, port: 6379 }\n",
        )
        .unwrap();
        let target = Target {
            kind: TargetKind::Deployment,
            name: "blog".into(),
            app_name: "blog".into(),
            folder: dir.path().to_path_buf(),
            run_folder: dir.path().to_path_buf(),
            services: Vec::new(),
        };

        let mut bus = EventBus::new();
        let mut registrar = PluginRegistrar::new("services", &mut bus);
        registrar.on_fn(Signal::ActivateVersion, contribute);

        let mut context = ActivationContext::default();
        bus.publish(&mut Event::ActivateVersion {
            target: &target,
            context: &mut context,
        })
        .unwrap();
        assert_eq!(
            context.app_config.service("cache"),
            Some(&json!({"host": "localhost", "port": 6379}))
        );
    }
}
