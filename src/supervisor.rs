//! Adapter over an external supervisord.
//!
//! Renders the main config and per-group fragments, and drives
//! `supervisorctl`. Every unsuccessful control call becomes a typed error;
//! callers never see raw exit codes.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use handlebars::{Handlebars, no_escape};
use sarge_plugin::{AutoRestart, CommandOutput, CommandRunner, Program};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    error::{IoResultExt, SargeError, SargeResult},
    fs_ops::{remove_file_if_exists, write_atomic},
    layout::HomeLayout,
};

const MAIN_TEMPLATE: &str = r#"; generated by sarge, do not edit
[unix_http_server]
file = {{run_dir}}/supervisor.sock

[supervisord]
logfile = {{log_dir}}/supervisord.log
pidfile = {{run_dir}}/supervisord.pid
directory = {{home}}

[rpcinterface:supervisor]
supervisor.rpcinterface_factory = supervisor.rpcinterface:make_main_rpcinterface

[supervisorctl]
serverurl = unix://{{run_dir}}/supervisor.sock

[include]
files = {{include_dir}}/*.conf
"#;

const GROUP_TEMPLATE: &str = r#"; generated by sarge for {{group}}
[group:{{group}}]
programs = {{members}}
{{#each programs}}

[program:{{this.full_name}}]
command = {{this.command}}
directory = {{this.directory}}
{{#if this.user}}user = {{this.user}}
{{/if}}redirect_stderr = true
stdout_logfile = {{this.log}}
startsecs = 0
autostart = false
autorestart = {{../autorestart}}
{{#if this.environment}}environment = {{this.environment}}
{{/if}}{{/each}}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum GroupAction {
    Start,
    Stop,
    Restart,
}

/// Everything needed to render one supervisor group.
#[derive(Debug, Clone)]
pub struct GroupSpec<'a> {
    pub name: &'a str,
    pub programs: &'a [Program],
    /// Working directory for programs that do not set one.
    pub directory: &'a Path,
    pub log_dir: &'a Path,
    pub user: Option<&'a str>,
    pub autorestart: AutoRestart,
}

/// `KEY="value",KEY2="value2"` with supervisord's quoting rules.
fn render_environment(program: &Program) -> String {
    program
        .environment
        .iter()
        .map(|(k, v)| {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"").replace('%', "%%");
            format!("{k}=\"{escaped}\"")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// supervisord expands `%(name)s` in `command`, so a literal `%` is doubled.
fn render_command(command: &str) -> String {
    command.replace('%', "%%")
}

/// A line break would end the ini value and start a new key.
fn single_line(group: &str, program: &Program) -> SargeResult<()> {
    fn breaks(s: &str) -> bool {
        s.contains(['\n', '\r'])
    }
    if breaks(&program.command) {
        return Err(SargeError::Config(format!(
            "program `{}` of `{group}`: command spans several lines",
            program.name
        )));
    }
    if let Some(key) = program.environment.keys().find(|k| breaks(k) || breaks(&program.environment[*k])) {
        return Err(SargeError::Config(format!(
            "program `{}` of `{group}`: environment `{key}` spans several lines",
            program.name
        )));
    }
    Ok(())
}

fn looks_not_running(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("refused connection")
        || lower.contains("no such file")
        || lower.contains("connection refused")
}

pub struct Supervisor {
    layout: HomeLayout,
    ctl: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    templates: Handlebars<'static>,
}

impl Supervisor {
    pub fn new(layout: HomeLayout, ctl: Vec<String>, runner: Arc<dyn CommandRunner>) -> SargeResult<Self> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(no_escape);
        templates.set_strict_mode(true);
        templates
            .register_template_string("main", MAIN_TEMPLATE)
            .map_err(|e| SargeError::Template(e.to_string()))?;
        templates
            .register_template_string("group", GROUP_TEMPLATE)
            .map_err(|e| SargeError::Template(e.to_string()))?;
        Ok(Self {
            layout,
            ctl,
            runner,
            templates,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.layout.supervisor_config()
    }

    pub fn fragment_path(&self, group: &str) -> PathBuf {
        self.layout
            .supervisor_include_dir()
            .join(format!("{group}.conf"))
    }

    pub fn render_main_config(&self) -> SargeResult<String> {
        let data = json!({
            "home": self.layout.root().display().to_string(),
            "run_dir": self.layout.run_dir().display().to_string(),
            "log_dir": self.layout.log_dir().display().to_string(),
            "include_dir": self.layout.supervisor_include_dir().display().to_string(),
        });
        self.templates
            .render("main", &data)
            .map_err(|e| SargeError::Template(e.to_string()))
    }

    /// Write `etc/supervisord.conf`. Overwrites an existing one.
    pub fn write_main_config(&self) -> SargeResult<PathBuf> {
        let path = self.config_path();
        write_atomic(&path, self.render_main_config()?.as_bytes())?;
        info!(path = %path.display(), "supervisor config written");
        Ok(path)
    }

    /// Program names inside a group are prefixed with the group name.
    pub fn program_name(group: &str, program: &str) -> String {
        format!("{group}_{program}")
    }

    pub fn render_group(&self, spec: &GroupSpec<'_>) -> SargeResult<String> {
        for program in spec.programs {
            single_line(spec.name, program)?;
        }
        let programs: Vec<_> = spec
            .programs
            .iter()
            .map(|p| {
                let full_name = Self::program_name(spec.name, &p.name);
                let directory = p.directory.as_deref().unwrap_or(spec.directory);
                let environment = render_environment(p);
                json!({
                    "full_name": full_name,
                    "command": render_command(&p.command),
                    "directory": directory.display().to_string(),
                    "user": spec.user,
                    "log": spec.log_dir.join(format!("{full_name}.log")).display().to_string(),
                    "environment": if environment.is_empty() { None } else { Some(environment) },
                })
            })
            .collect();
        let members = spec
            .programs
            .iter()
            .map(|p| Self::program_name(spec.name, &p.name))
            .collect::<Vec<_>>()
            .join(",");
        let autorestart = match spec.autorestart {
            AutoRestart::Always => "true",
            AutoRestart::Never => "false",
        };
        let data = json!({
            "group": spec.name,
            "members": members,
            "autorestart": autorestart,
            "programs": programs,
        });
        self.templates
            .render("group", &data)
            .map_err(|e| SargeError::Template(e.to_string()))
    }

    /// Install a rendered fragment where the main config includes it.
    pub fn apply_config(&self, group: &str, text: &str) -> SargeResult<PathBuf> {
        let path = self.fragment_path(group);
        let dir = self.layout.supervisor_include_dir();
        fs::create_dir_all(&dir).at(&dir)?;
        write_atomic(&path, text.as_bytes())?;
        debug!(group, path = %path.display(), "fragment installed");
        Ok(path)
    }

    fn ctl(&self, args: &[&str], group: &str, action: &str) -> SargeResult<CommandOutput> {
        let mut argv = self.ctl.clone();
        argv.push("-c".into());
        argv.push(self.config_path().display().to_string());
        argv.extend(args.iter().map(|s| s.to_string()));

        let output = self.runner.run(&argv, None).map_err(|e| SargeError::SupervisorControl {
            group: group.to_string(),
            action: action.to_string(),
            detail: e.to_string(),
        })?;
        if output.success() {
            return Ok(output);
        }
        let detail = output.combined();
        if looks_not_running(&detail) {
            Err(SargeError::SupervisorNotRunning {
                group: group.to_string(),
                detail,
            })
        } else {
            Err(SargeError::SupervisorControl {
                group: group.to_string(),
                action: action.to_string(),
                detail,
            })
        }
    }

    /// Reread and apply configuration. Safe when nothing changed.
    pub fn update(&self) -> SargeResult<()> {
        self.ctl(&["reread"], "*", "reread")?;
        self.ctl(&["update"], "*", "update")?;
        Ok(())
    }

    /// Act on every program of `group` (`<group>:*`).
    pub fn control_group(&self, group: &str, action: GroupAction) -> SargeResult<()> {
        let pattern = format!("{group}:*");
        let verb = action.to_string();
        self.ctl(&[verb.as_str(), pattern.as_str()], group, &verb)?;
        info!(group, action = %verb, "supervisor group controlled");
        Ok(())
    }

    pub fn status(&self) -> SargeResult<String> {
        let mut argv = self.ctl.clone();
        argv.push("-c".into());
        argv.push(self.config_path().display().to_string());
        argv.push("status".into());
        let output = self.runner.run(&argv, None)?;
        // `status` exits non-zero when some program is not RUNNING.
        let text = output.combined();
        if !output.success() && looks_not_running(&text) {
            return Err(SargeError::SupervisorNotRunning {
                group: "*".to_string(),
                detail: text,
            });
        }
        Ok(text)
    }

    /// Stop the group, drop its fragment and let supervisord forget it.
    ///
    /// Tolerates a stopped group and an absent supervisord.
    pub fn remove_group(&self, group: &str) -> SargeResult<()> {
        if let Err(e) = self.control_group(group, GroupAction::Stop) {
            debug!(group, error = %e, "stop before removal failed, ignoring");
        }
        remove_file_if_exists(&self.fragment_path(group))?;
        match self.update() {
            Ok(()) => Ok(()),
            Err(SargeError::SupervisorNotRunning { detail, .. }) => {
                warn!(group, %detail, "supervisord not running, fragment removed only");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
