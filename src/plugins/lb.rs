//! Shared load-balancer table.
//!
//! One route fragment per process name maps its stable port to the port the
//! current instance listens on. HAProxy cannot be patched incrementally, so
//! every change rebuilds `etc/haproxy.cfg` from all fragments and reloads.
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use sarge_plugin::{Event, PluginError, PluginRegistrar, Signal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{PluginHost, listen::PORT_ENV, render, write_file};

const TABLE_TEMPLATE: &str = "# generated by sarge, do not edit
global
    daemon

defaults
    mode http
    timeout connect 5s
    timeout client 60s
    timeout server 60s
{{#each routes}}

listen {{this.process}}
    bind *:{{this.stable_port}}
    server {{this.instance}} 127.0.0.1:{{this.port}}
{{/each}}
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub instance: String,
    pub process: String,
    pub stable_port: u16,
    pub port: u16,
}

fn fragment_path(dir: &Path, process: &str) -> PathBuf {
    dir.join(format!("{process}.json"))
}

/// All current routes, sorted by process name.
pub fn read_routes(dir: &Path) -> Result<Vec<Route>, PluginError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PluginError::io(dir, e)),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|path| -> Result<Route, PluginError> {
            let text = fs::read_to_string(path).map_err(|e| PluginError::io(path, e))?;
            Ok(serde_json::from_str(&text)?)
        })
        .collect()
}

pub fn render_table(routes: &[Route]) -> Result<String, PluginError> {
    render(TABLE_TEMPLATE, &json!({ "routes": routes }))
}

/// Rebuild the table from every fragment and reload the balancer.
pub fn regenerate(host: &PluginHost) -> Result<(), PluginError> {
    let routes = read_routes(&host.layout.lb_dir())?;
    let table = render_table(&routes)?;
    let path = host.layout.haproxy_config();
    write_file(&path, table.as_bytes())?;
    info!(routes = routes.len(), path = %path.display(), "load balancer table rebuilt");
    host.reload("haproxy", host.config.lb_reload.as_ref())
}

fn drop_routes_of(host: &PluginHost, instance: &str) -> Result<usize, PluginError> {
    let dir = host.layout.lb_dir();
    let mut dropped = 0;
    for route in read_routes(&dir)? {
        if route.instance == instance {
            let path = fragment_path(&dir, &route.process);
            fs::remove_file(&path).map_err(|e| PluginError::io(&path, e))?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

pub fn register(host: &Arc<PluginHost>, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
    registrar.on_fn(Signal::WillStart, {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            let Event::WillStart { target, context } = event else {
                return Ok(());
            };
            let dir = host.layout.lb_dir();
            fs::create_dir_all(&dir).map_err(|e| PluginError::io(&dir, e))?;
            let mut changed = false;
            for program in &context.programs {
                let Some(stable_port) = host.config.stable_port(&program.name) else {
                    continue;
                };
                let Some(port) = program.environment.get(PORT_ENV) else {
                    debug!(program = %program.name, "no listen port, no route");
                    continue;
                };
                let port: u16 = port
                    .parse()
                    .map_err(|_| PluginError::Other(format!("bad {PORT_ENV} `{port}` for {}", program.name)))?;
                let route = Route {
                    instance: target.name.clone(),
                    process: program.name.clone(),
                    stable_port,
                    port,
                };
                let path = fragment_path(&dir, &route.process);
                write_file(&path, &serde_json::to_vec_pretty(&route)?)?;
                changed = true;
            }
            if changed {
                regenerate(&host)?;
            }
            Ok(())
        }
    });

    let forget = {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            let (Event::HasStopped { target } | Event::WillDestroy { target }) = event else {
                return Ok(());
            };
            if drop_routes_of(&host, &target.name)? > 0 {
                regenerate(&host)?;
            }
            Ok(())
        }
    };
    let forget = Arc::new(forget);
    registrar.on(Signal::HasStopped, forget.clone());
    registrar.on(Signal::WillDestroy, forget);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lists_one_listener_per_route() {
        let routes = vec![
            Route {
                instance: "x7k2pq".into(),
                process: "web".into(),
                stable_port: 8080,
                port: 41234,
            },
            Route {
                instance: "x7k2pq".into(),
                process: "api".into(),
                stable_port: 9090,
                port: 41235,
            },
        ];
        let table = render_table(&routes).unwrap();
        assert!(table.contains("listen web\n    bind *:8080\n    server x7k2pq 127.0.0.1:41234"));
        assert!(table.contains("listen api\n    bind *:9090"));
        assert!(render_table(&[]).unwrap().find("listen ").is_none());
    }

    #[test]
    fn fragments_are_read_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for (process, port) in [("web", 1), ("api", 2)] {
            let route = Route {
                instance: "1".into(),
                process: process.into(),
                stable_port: 8000 + port,
                port: 40000 + port,
            };
            fs::write(
                fragment_path(dir.path(), process),
                serde_json::to_string(&route).unwrap(),
            )
            .unwrap();
        }
        let routes = read_routes(dir.path()).unwrap();
        let names: Vec<&str> = routes.iter().map(|r| r.process.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
    }
}
