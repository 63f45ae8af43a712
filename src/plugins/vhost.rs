//! Per-application nginx site generator.
//!
//! Deployments get `<run>/nginx-site.conf`, written before the active pointer
//! moves and picked up by nginx through `active/*/nginx-site.conf`. Instances
//! get `etc/nginx.d/<id>.conf`. Each `urlmap` entry renders exactly one
//! location block, in descriptor order.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use sarge_plugin::{
    AppDescriptor, Event, PluginError, PluginRegistrar, QUICK_WSGI_SOCKET, Signal, Target,
    TargetKind, UrlEntry,
};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{PluginHost, render, write_file};

pub const SITE_FILE: &str = "nginx-site.conf";

const SITE_TEMPLATE: &str = "# generated by sarge for {{name}}
server {
{{#each options}}    {{@key}} {{this}};
{{/each}}{{#each locations}}
{{this}}
{{/each}}
}
";

const STATIC_BLOCK: &str = "    location {{url}} {
        alias {{path}};
    }";

const FASTCGI_BLOCK: &str = "    location {{url}} {
        include fastcgi_params;
        fastcgi_param SCRIPT_NAME \"\";
        fastcgi_param PATH_INFO $uri;
        fastcgi_pass unix:{{socket}};
    }";

const PHP_BLOCK: &str = "    location {{url}} {
        alias {{path}};
        index index.php;
        location ~ \\.php$ {
            include fastcgi_params;
            fastcgi_param SCRIPT_FILENAME $request_filename;
            fastcgi_pass unix:{{socket}};
        }
    }";

const PROXY_BLOCK: &str = "    location {{url}} {
        proxy_pass {{upstream}};
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    }";

fn resolve(base: &Path, relative: &str) -> String {
    base.join(relative).display().to_string()
}

/// Upstreams must be absolute http(s) URLs. The text is rendered as written:
/// nginx treats a trailing `/` on `proxy_pass` as a URI replacement.
fn check_upstream(upstream: &str) -> Result<(), PluginError> {
    let parsed = Url::parse(upstream)
        .map_err(|e| PluginError::Other(format!("bad proxy upstream `{upstream}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(PluginError::Other(format!(
            "proxy upstream `{upstream}` must be http(s) with a host, got `{scheme}`"
        ))),
    }
}

fn render_location(entry: &UrlEntry, target: &Target) -> Result<String, PluginError> {
    match entry {
        UrlEntry::Static { url, path } => render(
            STATIC_BLOCK,
            &json!({ "url": url, "path": resolve(&target.folder, path) }),
        ),
        UrlEntry::Wsgi { url, socket } => {
            let socket = socket.as_deref().unwrap_or(QUICK_WSGI_SOCKET);
            render(
                FASTCGI_BLOCK,
                &json!({ "url": url, "socket": resolve(&target.run_folder, socket) }),
            )
        }
        UrlEntry::Fcgi { url, socket } => render(
            FASTCGI_BLOCK,
            &json!({ "url": url, "socket": resolve(&target.run_folder, socket) }),
        ),
        UrlEntry::Php { url, path, socket } => render(
            PHP_BLOCK,
            &json!({
                "url": url,
                "path": resolve(&target.folder, path),
                "socket": resolve(&target.run_folder, socket),
            }),
        ),
        UrlEntry::Proxy { url, upstream } => {
            check_upstream(upstream)?;
            render(PROXY_BLOCK, &json!({ "url": url, "upstream": upstream }))
        }
    }
}

/// Render the site for `target`, or `None` when it ships no descriptor.
pub fn render_site(target: &Target) -> Result<Option<String>, PluginError> {
    let Some(descriptor) = AppDescriptor::load(&target.folder)? else {
        return Ok(None);
    };
    let locations = descriptor
        .urlmap
        .iter()
        .map(|entry| render_location(entry, target))
        .collect::<Result<Vec<_>, _>>()?;
    render(
        SITE_TEMPLATE,
        &json!({
            "name": target.name,
            "options": descriptor.nginx_options,
            "locations": locations,
        }),
    )
    .map(Some)
}

fn site_path(host: &PluginHost, target: &Target) -> PathBuf {
    match target.kind {
        TargetKind::Deployment => target.run_folder.join(SITE_FILE),
        TargetKind::Instance => host.layout.nginx_dir().join(format!("{}.conf", target.name)),
    }
}

fn write_site(host: &PluginHost, target: &Target) -> Result<bool, PluginError> {
    let Some(site) = render_site(target)? else {
        debug!(app = %target.app_name, "no descriptor, no site");
        return Ok(false);
    };
    let path = site_path(host, target);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PluginError::io(parent, e))?;
    }
    write_file(&path, site.as_bytes())?;
    info!(app = %target.app_name, path = %path.display(), "site written");
    Ok(true)
}

pub fn register(host: &Arc<PluginHost>, registrar: &mut PluginRegistrar<'_>) -> Result<(), PluginError> {
    // Site file must exist before the pointer moves; reload after.
    registrar.on_fn(Signal::ActivateVersion, {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            if let Event::ActivateVersion { target, .. } = event {
                write_site(&host, target)?;
            }
            Ok(())
        }
    });
    registrar.on_fn(Signal::VersionActivated, {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            if let Event::VersionActivated { target, .. } = event {
                if site_path(&host, target).is_file() {
                    host.reload("nginx", host.config.nginx_reload.as_ref())?;
                }
            }
            Ok(())
        }
    });
    registrar.on_fn(Signal::WillStart, {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            if let Event::WillStart { target, .. } = event {
                if write_site(&host, target)? {
                    host.reload("nginx", host.config.nginx_reload.as_ref())?;
                }
            }
            Ok(())
        }
    });
    registrar.on_fn(Signal::WillDestroy, {
        let host = host.clone();
        move |event: &mut Event<'_>| -> Result<(), PluginError> {
            if let Event::WillDestroy { target } = event {
                let path = site_path(&host, target);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        info!(app = %target.app_name, path = %path.display(), "site removed");
                        host.reload("nginx", host.config.nginx_reload.as_ref())?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(PluginError::io(&path, e)),
                }
            }
            Ok(())
        }
    });
    Ok(())
}
