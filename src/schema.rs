use std::{
    fs,
    path::{Path, PathBuf},
};

use sarge_plugin::{AppDescriptor, DeploymentConfig};
use schemars::schema_for;

use crate::{
    config::SargeConfig,
    error::{IoResultExt, SargeResult},
};

/// JSON Schemas for every file an operator writes by hand, keyed by file name.
pub fn schemas() -> SargeResult<Vec<(&'static str, String)>> {
    Ok(vec![
        (
            "sarge.schema.json",
            serde_json::to_string_pretty(&schema_for!(SargeConfig))?,
        ),
        (
            "deployment.schema.json",
            serde_json::to_string_pretty(&schema_for!(DeploymentConfig))?,
        ),
        (
            "sargeapp.schema.json",
            serde_json::to_string_pretty(&schema_for!(AppDescriptor))?,
        ),
    ])
}

/// Write the schemas into `out_dir`, returning the written paths.
pub fn write_schema(out_dir: &Path) -> SargeResult<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).at(out_dir)?;
    let mut written = Vec::new();
    for (name, json) in schemas()? {
        let path = out_dir.join(name);
        fs::write(&path, json).at(&path)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn schemas_describe_descriptor_fields() {
        let dir = tempdir().unwrap();
        let paths = write_schema(dir.path()).unwrap();
        assert_eq!(paths.len(), 3);

        let deployment: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("deployment.schema.json")).unwrap())
                .unwrap();
        let props = &deployment["properties"];
        assert!(props.get("require-services").is_some());
        assert!(props.get("autorestart").is_some());
    }
}
