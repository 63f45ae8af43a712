//! Gives every program listed in `port_map` a free loopback port as `PORT`.
use std::{collections::BTreeMap, net::TcpListener, sync::Arc};

use sarge_plugin::{Event, PluginError, PluginRegistrar, Signal};
use tracing::debug;

use super::PluginHost;

pub const PORT_ENV: &str = "PORT";

/// Ask the kernel for an unused port on 127.0.0.1.
pub fn free_port() -> Result<u16, PluginError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| PluginError::io("127.0.0.1:0", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| PluginError::io("127.0.0.1:0", e))?
        .port();
    Ok(port)
}

pub fn register(host: &Arc<PluginHost>, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
    let port_map: BTreeMap<String, u16> = host.config.port_map.clone();
    let handler = move |event: &mut Event<'_>| -> Result<(), PluginError> {
        let (Event::ActivateVersion { target, context } | Event::WillStart { target, context }) = event
        else {
            return Ok(());
        };
        for program in context.programs.iter_mut() {
            if !port_map.contains_key(&program.name) || program.environment.contains_key(PORT_ENV) {
                continue;
            }
            let port = free_port()?;
            debug!(app = %target.app_name, program = %program.name, port, "listen port allocated");
            program.environment.insert(PORT_ENV.to_string(), port.to_string());
        }
        Ok(())
    };
    let handler = Arc::new(handler);
    registrar.on(Signal::ActivateVersion, handler.clone());
    registrar.on(Signal::WillStart, handler);
    Ok(())
}
