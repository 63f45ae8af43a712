use std::path::PathBuf;

use clap::Args;
use sarge::schema::{schemas, write_schema};

use super::CliContext;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schemas into this directory instead of printing them
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<i32> {
    match args.out {
        Some(out_dir) => {
            for path in write_schema(&out_dir)? {
                println!("{}", path.display());
            }
        }
        None => {
            for (name, json) in schemas()? {
                println!("// {name}\n{json}");
            }
        }
    }
    Ok(0)
}
