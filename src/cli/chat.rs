use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CliContext;
use chatflow::agent::{AgentDirectory, GeneratorHandoff, HistoryStore};
use chatflow::channel::{ConsoleTransport, ConversationRouter};
use chatflow::chatbot::{ChatbotFlow, SessionDriver};
use chatflow::registry::FunctionRegistry;
use chatflow::store;

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Chat-bot definition (JSON or YAML)
    pub bot: PathBuf,

    /// Agent list for the bot's agent flows
    #[arg(long)]
    pub agents: Option<PathBuf>,

    /// Conversation user id
    #[arg(long, default_value = "local")]
    pub user: String,
}

pub async fn execute(args: ChatArgs, context: &CliContext) -> anyhow::Result<()> {
    let bot = ChatbotFlow::from_path(&args.bot)
        .with_context(|| format!("loading {}", args.bot.display()))?;
    let agents = match &args.agents {
        Some(path) => AgentDirectory::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentDirectory::default(),
    };
    bot.validate(Some(&agents)).context("invalid chat bot")?;

    let config = context.engine.clone();
    let store = store::from_config(&config)?;
    info!(store = store.name(), "conversation store ready");

    let transport = Arc::new(ConsoleTransport::new(args.user));
    let history = HistoryStore::new(config.history_window, config.state_ttl);
    let handoff = GeneratorHandoff::new(reqwest::Client::new(), history)
        .with_transport(transport.clone());
    let driver = SessionDriver::new(store, FunctionRegistry::with_builtins(), agents, config);
    let router = ConversationRouter::new(
        transport,
        Arc::new(driver),
        Arc::new(bot),
        Arc::new(handoff),
    );

    let (tx, rx) = mpsc::channel::<Vec<u8>>(16);
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(router.serve(rx, shutdown.clone()));

    println!("Chatting with {}; Ctrl-D or Ctrl-C to quit.", args.bot.display());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                shutdown.cancel();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if tx.send(line.into_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin closed: {e}");
                    break;
                }
            }
        }
    }
    drop(tx);
    server.await.context("router task failed")?;
    println!("Goodbye!");
    Ok(())
}
