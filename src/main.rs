use std::process::ExitCode;

use clap::Parser;
use sarge::{
    SargeError,
    logger::{init_stderr, init_tracing},
};

mod cli;

use cli::{Cli, CliContext, Commands};

fn exit_code(err: &anyhow::Error) -> u8 {
    let fatal = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<SargeError>())
        .any(SargeError::is_fatal);
    if fatal { 2 } else { 1 }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let context = match CliContext::new(cli.home.clone()) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };

    // The schema command needs no home.
    let _guard = match &cli.command {
        Commands::Schema(_) => {
            init_stderr(&cli.log_level);
            None
        }
        _ => match init_tracing(&context.home.join("var").join("log"), &cli.log_level) {
            Ok(guard) => Some(guard),
            Err(e) => {
                init_stderr(&cli.log_level);
                tracing::warn!(error = %e, "file logging unavailable");
                None
            }
        },
    };

    match cli::execute(&context, cli.command) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
