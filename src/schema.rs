use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use schemars::{JsonSchema, schema_for};
use tracing::info;

use crate::agent::AgentConfig;
use crate::chatbot::{ChatbotFlow, ConversationFrame};
use crate::flow::FlowStep;

fn write_one<T: JsonSchema>(out_dir: &Path, file: &str) -> Result<PathBuf, Error> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    let path = out_dir.join(file);
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(schema = %path.display(), "schema written");
    Ok(path)
}

/// Write the JSON Schemas of every definition format into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    Ok(vec![
        write_one::<Vec<FlowStep>>(out_dir, "flow.schema.json")?,
        write_one::<ChatbotFlow>(out_dir, "chatbot.schema.json")?,
        write_one::<Vec<AgentConfig>>(out_dir, "agents.schema.json")?,
        write_one::<ConversationFrame>(out_dir, "frame.schema.json")?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn schemas_are_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(dir.path()).unwrap();
        assert_eq!(written.len(), 4);

        let chatbot: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("chatbot.schema.json")).unwrap())
                .unwrap();
        assert!(chatbot["properties"]["flows"].is_object());

        let flow: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("flow.schema.json")).unwrap())
                .unwrap();
        assert_eq!(flow["type"], "array");
    }
}
