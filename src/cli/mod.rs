use std::path::PathBuf;

use channel_transport::LogLevel;
use clap::{Parser, Subcommand};

pub mod chat;
pub mod run;
pub mod schema;
pub mod validate;

use chat::ChatArgs;
use run::RunArgs;
use schema::SchemaArgs;
use validate::ValidateArgs;

use chatflow::config::{ConfigManager, EngineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "chatflow",
    about = "Run step flows and chat bots",
    version
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Write rolling logs into this directory instead of stdout
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Dotenv file with CHATFLOW_* settings and agent keys
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a step flow and print the final state
    Run(RunArgs),

    /// Check a step flow or chat-bot definition
    Validate(ValidateArgs),

    /// Talk to a chat bot from the terminal
    Chat(ChatArgs),

    /// Emit JSON-Schema for the definition formats
    Schema(SchemaArgs),
}

pub struct CliContext {
    pub config_manager: ConfigManager,
    pub engine: EngineConfig,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager, engine: EngineConfig) -> Self {
        Self {
            config_manager,
            engine,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Validate(args) => validate::execute(args, context).await,
        Commands::Chat(args) => chat::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}
