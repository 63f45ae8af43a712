use std::{collections::BTreeMap, path::PathBuf};

use clap::Args;
use sarge::{SargeError, instance::APPLICATION_NAME, registry::NEWEST};
use tracing::{error, info};

use super::{CliContext, deployment::describe};

#[derive(Args, Debug)]
pub struct InstanceArgs {
    /// Instance id, or "newest"
    #[arg(short = 'd', long = "id", default_value = NEWEST)]
    pub id: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Instance id, or "newest"
    #[arg(short = 'd', long = "id", default_value = NEWEST)]
    pub id: String,

    /// Command to run; an interactive shell when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    pub tarball: PathBuf,

    /// Only run this Procfile process
    pub process: Option<String>,

    /// Application name; defaults to the tarball's name
    #[arg(long)]
    pub app: Option<String>,
}

pub fn list(context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    for (name, state) in sarge.deployment_states()? {
        println!("deployment {name}\t{}", describe(&state));
    }
    for instance in sarge.list_buckets()? {
        let meta = instance
            .meta
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("instance {}\t{meta}", instance.id);
    }
    Ok(0)
}

pub fn start(args: InstanceArgs, context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    let instance = sarge.start_bucket(&args.id)?;
    println!("instance {} started", instance.id);
    Ok(0)
}

pub fn stop(args: InstanceArgs, context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    let instance = sarge.stop_bucket(&args.id)?;
    println!("instance {} stopped", instance.id);
    Ok(0)
}

pub fn destroy(args: InstanceArgs, context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    let instance = sarge.get_bucket(&args.id)?;
    sarge.destroy(&instance.id)?;
    println!("instance {} destroyed", instance.id);
    Ok(0)
}

pub fn run(args: RunArgs, context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    let instance = sarge.get_bucket(&args.id)?;
    Ok(instance.run(&args.command)?)
}

pub fn deploy(args: DeployArgs, context: &CliContext) -> anyhow::Result<i32> {
    let sarge = context.open()?;
    let mut meta = BTreeMap::new();
    if let Some(app) = args.app {
        meta.insert(APPLICATION_NAME.to_string(), app);
    }

    match sarge.deploy(&args.tarball, args.process.as_deref(), meta) {
        Ok(instance) => {
            println!("{}", instance.id);
            Ok(0)
        }
        Err(SargeError::Deploy {
            name,
            instance: Some(instance),
            version,
            source,
        }) => {
            // 1) report the original failure
            // 2) compensate, and report that outcome on its own
            match sarge.destroy(&instance.id) {
                Ok(()) => {
                    info!(instance = %instance.id, "partially deployed instance removed");
                    eprintln!("cleanup: instance {} removed", instance.id);
                }
                Err(cleanup) => {
                    error!(instance = %instance.id, error = %cleanup, "cleanup failed");
                    eprintln!("cleanup: removing instance {} failed: {cleanup}", instance.id);
                }
            }
            Err(SargeError::Deploy {
                name,
                instance: Some(instance),
                version,
                source,
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}
