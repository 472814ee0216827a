use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use serde_json::{Map, Value};
use tracing::{error, info};

use super::CliContext;
use chatflow::flow::{ExecutionOutcome, FlowDefinition, FlowEngine};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Step flow definition (JSON or YAML)
    pub flow: PathBuf,

    /// Seed the state bag; values parse as JSON when they can (`n=5`, `tags=["a"]`)
    #[arg(long = "state", value_name = "KEY=VALUE")]
    pub state: Vec<String>,

    /// Start at this step instead of the first one
    #[arg(long)]
    pub from: Option<String>,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

fn parse_state(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut state = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("state entry `{pair}` is not KEY=VALUE");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        state.insert(key.trim().to_string(), value);
    }
    Ok(state)
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let definition = FlowDefinition::from_path(&args.flow)
        .with_context(|| format!("loading {}", args.flow.display()))?;

    let mut engine = FlowEngine::new(context.engine.clone());
    engine.load_definition(definition);
    engine.seed(parse_state(&args.state)?);

    let outcome = match (&args.from, args.timeout) {
        (Some(step), _) => engine.execute_from(step).await,
        (None, Some(secs)) => engine.execute_with_deadline(Duration::from_secs(secs)).await,
        (None, None) => engine.execute().await,
    };

    let state = serde_json::to_string_pretty(&Value::Object(engine.state().snapshot()))?;
    match outcome {
        Ok(ExecutionOutcome::Completed) => {
            info!("flow completed");
            println!("{state}");
            Ok(())
        }
        Ok(ExecutionOutcome::AwaitingInput { step }) => {
            info!(step = %step, "flow waiting for input");
            println!("{state}");
            println!("waiting for input at `{step}`; continue with --from <next step>");
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), "flow failed: {e}");
            println!("{state}");
            Err(e).context("flow execution failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_values_parse_as_json_when_possible() {
        let state = parse_state(&[
            "x=7".to_string(),
            "name=Ada".to_string(),
            "tags=[\"a\"]".to_string(),
            "eq=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(Value::Object(state), json!({"x": 7, "name": "Ada", "tags": ["a"], "eq": "a=b"}));
        assert!(parse_state(&["novalue".to_string()]).is_err());
    }
}
