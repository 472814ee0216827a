use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Args;
use serde_json::Value;

use super::CliContext;
use chatflow::agent::AgentDirectory;
use chatflow::chatbot::ChatbotFlow;
use chatflow::config::read_definition;
use chatflow::flow::FlowDefinition;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Step flow or chat-bot definition (JSON or YAML)
    pub file: PathBuf,

    /// Agent list used to check the bot's agent flows
    #[arg(long)]
    pub agents: Option<PathBuf>,
}

/// What a definition document turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Definition {
    Flow { steps: usize },
    Chatbot { flows: usize },
}

/// A document with `flows` or `keywords` is a bot; anything else a step flow.
pub fn validate_file(path: &Path, agents: Option<&AgentDirectory>) -> anyhow::Result<Definition> {
    let raw: Value = read_definition(path)?;
    let is_bot = raw
        .as_object()
        .is_some_and(|o| o.contains_key("flows") || o.contains_key("keywords"));
    if is_bot {
        let bot = ChatbotFlow::from_path(path)?;
        bot.validate(agents)?;
        Ok(Definition::Chatbot {
            flows: bot.flows.len(),
        })
    } else {
        let flow = FlowDefinition::from_path(path)?;
        Ok(Definition::Flow {
            steps: flow.steps().len(),
        })
    }
}

pub async fn execute(args: ValidateArgs, _context: &CliContext) -> anyhow::Result<()> {
    let agents = args
        .agents
        .as_deref()
        .map(AgentDirectory::from_path)
        .transpose()
        .context("loading agents")?;
    match validate_file(&args.file, agents.as_ref()) {
        Ok(Definition::Flow { steps }) => {
            println!("{}: valid step flow ({steps} steps)", args.file.display());
            Ok(())
        }
        Ok(Definition::Chatbot { flows }) => {
            println!("{}: valid chat bot ({flows} flows)", args.file.display());
            Ok(())
        }
        Err(e) => bail!("{}: {e}", args.file.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_document_kind() {
        let dir = tempfile::tempdir().unwrap();
        let flow = dir.path().join("flow.json");
        fs::write(
            &flow,
            r#"[{"name": "a", "type": "delay", "params": {"duration": "1s"}}]"#,
        )
        .unwrap();
        assert_eq!(validate_file(&flow, None).unwrap(), Definition::Flow { steps: 1 });

        let bot = dir.path().join("bot.yaml");
        fs::write(
            &bot,
            "keywords:\n  menu: main\nflows:\n  main:\n    type: menu\n    text: Pick\n",
        )
        .unwrap();
        assert_eq!(validate_file(&bot, None).unwrap(), Definition::Chatbot { flows: 1 });
    }

    #[test]
    fn dangling_bot_references_fail() {
        let dir = tempfile::tempdir().unwrap();
        let bot = dir.path().join("bot.json");
        fs::write(&bot, r#"{"keywords": {"menu": "nowhere"}, "flows": {}}"#).unwrap();
        assert!(validate_file(&bot, None).is_err());
    }
}
