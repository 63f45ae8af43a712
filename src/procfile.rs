//! `Procfile` parsing: one `name: command` per line.
use std::{fs, path::Path};

use sarge_plugin::Program;

use crate::error::{IoResultExt, SargeError, SargeResult};

pub const PROCFILE: &str = "Procfile";

pub fn parse(text: &str, origin: &Path) -> SargeResult<Vec<Program>> {
    let mut programs: Vec<Program> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, command) = line.split_once(':').ok_or_else(|| SargeError::InvalidDescriptor {
            path: origin.to_path_buf(),
            reason: format!("line {}: expected `name: command`", lineno + 1),
        })?;
        let (name, command) = (name.trim(), command.trim());
        if name.is_empty() || command.is_empty() {
            return Err(SargeError::InvalidDescriptor {
                path: origin.to_path_buf(),
                reason: format!("line {}: empty process name or command", lineno + 1),
            });
        }
        if programs.iter().any(|p| p.name == name) {
            return Err(SargeError::InvalidDescriptor {
                path: origin.to_path_buf(),
                reason: format!("line {}: duplicate process `{name}`", lineno + 1),
            });
        }
        programs.push(Program::new(name, command));
    }
    Ok(programs)
}

/// Programs from `<folder>/Procfile`, or `None` when there is none.
pub fn load(folder: &Path) -> SargeResult<Option<Vec<Program>>> {
    let path = folder.join(PROCFILE);
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).at(&path)?;
    parse(&text, &path).map(Some)
}
