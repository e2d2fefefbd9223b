use std::{fs, path::Path, path::PathBuf};

use anyhow::Error;
use schemars::{schema_for, JsonSchema};
use worker_client::message::{
    ApplicationInfo, ErrorRecord, InstanceRecord, JobStatus, LogRecord, PluginRecord,
    PollJobParams, SubmitJobParams, SubmitJobResult,
};

use crate::engine::EngineState;

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<PathBuf, Error> {
    let schema = schema_for!(T);
    let path = out_dir.join(format!("{name}.schema.json"));
    fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    Ok(path)
}

/// Write one `<name>.schema.json` per record exchanged with a worker host.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)?;
    Ok(vec![
        write_one::<InstanceRecord>(out_dir, "instance")?,
        write_one::<PluginRecord>(out_dir, "plugin")?,
        write_one::<JobStatus>(out_dir, "job-status")?,
        write_one::<ErrorRecord>(out_dir, "error")?,
        write_one::<LogRecord>(out_dir, "log")?,
        write_one::<ApplicationInfo>(out_dir, "application")?,
        write_one::<SubmitJobParams>(out_dir, "submit-job")?,
        write_one::<SubmitJobResult>(out_dir, "submit-job-result")?,
        write_one::<PollJobParams>(out_dir, "poll-job")?,
        write_one::<EngineState>(out_dir, "engine-state")?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn writes_a_schema_per_record() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("schemas");
        let written = write_schema(&out).unwrap();
        assert_eq!(written.len(), 10);

        let plugin: Value =
            serde_json::from_str(&fs::read_to_string(out.join("plugin.schema.json")).unwrap())
                .unwrap();
        assert!(plugin["properties"].get("type").is_some());
        assert!(plugin["properties"].get("order").is_some());
    }
}
