use std::path::Path;

use anyhow::Context;
use sarge::{SargeError, deployment::DeploymentState};

use super::CliContext;

pub fn new_version(context: &CliContext, name: &str) -> anyhow::Result<i32> {
    let folder = context.open()?.new_version(name)?;
    println!("{}", folder.display());
    Ok(0)
}

pub fn activate(context: &CliContext, name: &str, folder: &Path) -> anyhow::Result<i32> {
    let run = context
        .open()?
        .activate_version(name, folder)
        .with_context(|| format!("activating {} for `{name}`", folder.display()))?;
    println!("{name} is live at {}", run.display());
    Ok(0)
}

pub fn start(context: &CliContext, name: &str) -> anyhow::Result<i32> {
    context.open()?.start(name)?;
    Ok(0)
}

pub fn stop(context: &CliContext, name: &str) -> anyhow::Result<i32> {
    context.open()?.stop(name)?;
    Ok(0)
}

pub fn versions(context: &CliContext, name: &str) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    for (number, folder) in sarge.deployment(name)?.versions()? {
        println!("{number}\t{}", folder.display());
    }
    Ok(0)
}

pub fn destroy(context: &CliContext, name: &str) -> anyhow::Result<i32> {
    context.open()?.destroy_deployment(name)?;
    println!("deployment `{name}` destroyed");
    Ok(0)
}

pub fn describe(state: &DeploymentState) -> String {
    match state {
        DeploymentState::NoVersion => "no version".to_string(),
        DeploymentState::VersionCreated { latest } => format!("not active (latest {})", latest.display()),
        DeploymentState::Active { run_folder } => format!("active ({})", run_folder.display()),
    }
}

pub fn status(context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    for (name, state) in sarge.deployment_states()? {
        println!("{name}\t{}", describe(&state));
    }
    match sarge.status() {
        Ok(text) => println!("{text}"),
        Err(SargeError::SupervisorNotRunning { detail, .. }) => {
            println!("supervisord is not running ({detail})");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(0)
}
