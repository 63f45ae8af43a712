use std::{env, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod bucket;
pub mod deployment;
pub mod init;
pub mod schema;

use bucket::{DeployArgs, InstanceArgs, RunArgs};
use schema::SchemaArgs;

use sarge::Sarge;

/// Environment variable naming the home when `--home` is not given.
pub const HOME_ENV: &str = "SARGE_HOME";

#[derive(Parser, Debug)]
#[command(
    name = "sarge",
    about = "Single-host deployment orchestrator driving supervisord",
    version
)]
pub struct Cli {
    /// Orchestrator home (default: $SARGE_HOME, else the current directory)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Log level or EnvFilter directive; SARGE_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the home layout and write the supervisor main config
    Init,

    /// Create the next version folder of a deployment and print its path
    NewVersion { name: String },

    /// Make a version folder the live version of a deployment
    ActivateVersion { name: String, folder: PathBuf },

    /// Start every program of a deployment
    Start { name: String },

    /// Stop every program of a deployment
    Stop { name: String },

    /// List the version folders of a deployment
    Versions { name: String },

    /// Remove a deployment, its versions and its programs
    DestroyDeployment { name: String },

    /// Show deployment states and supervisord status
    Status,

    /// List deployments and instances
    List,

    /// Start the programs of an instance again
    StartInstance(InstanceArgs),

    /// Stop the programs of an instance and withdraw its routes
    StopInstance(InstanceArgs),

    /// Destroy an instance
    Destroy(InstanceArgs),

    /// Run a command inside an instance with its environment
    Run(RunArgs),

    /// Create, configure and start an instance from a tarball
    Deploy(DeployArgs),

    /// Emit JSON Schema for the configuration and descriptor files
    Schema(SchemaArgs),
}

pub struct CliContext {
    pub home: PathBuf,
}

impl CliContext {
    pub fn new(home: Option<PathBuf>) -> anyhow::Result<Self> {
        let home = match home {
            Some(home) => home,
            None => match env::var_os(HOME_ENV) {
                Some(home) => PathBuf::from(home),
                None => env::current_dir().context("resolving current directory")?,
            },
        };
        Ok(Self { home })
    }

    pub fn open(&self) -> anyhow::Result<Sarge> {
        Sarge::open(&self.home).with_context(|| format!("opening home {}", self.home.display()))
    }
}

pub fn execute(context: &CliContext, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Init => init::execute(context),
        Commands::NewVersion { name } => deployment::new_version(context, &name),
        Commands::ActivateVersion { name, folder } => deployment::activate(context, &name, &folder),
        Commands::Start { name } => deployment::start(context, &name),
        Commands::Stop { name } => deployment::stop(context, &name),
        Commands::Versions { name } => deployment::versions(context, &name),
        Commands::DestroyDeployment { name } => deployment::destroy(context, &name),
        Commands::Status => deployment::status(context),
        Commands::List => bucket::list(context),
        Commands::StartInstance(args) => bucket::start(args, context),
        Commands::StopInstance(args) => bucket::stop(args, context),
        Commands::Destroy(args) => bucket::destroy(args, context),
        Commands::Run(args) => bucket::run(args, context),
        Commands::Deploy(args) => bucket::deploy(args, context),
        Commands::Schema(args) => schema::execute(args, context),
    }
}
