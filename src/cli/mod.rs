//! Command-line interface for reqforge.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// reqforge: requirement validation workflow orchestrator.
#[derive(Parser)]
#[command(name = "reqforge", version, about)]
pub struct Cli {
    /// Log level (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the validation workflow over a requirement document.
    Run {
        /// Path to the document to mine requirements from.
        #[arg(long)]
        document: PathBuf,

        /// Correlation id for the run (generated if omitted).
        #[arg(long)]
        correlation_id: Option<String>,

        /// Base URL of the capability API.
        #[arg(long, env = "REQFORGE_API_BASE")]
        api_base: String,

        /// Bearer token for the capability API.
        #[arg(long, env = "REQFORGE_API_KEY")]
        api_key: Option<String>,
    },

    /// Evaluate a single requirement text against the capability API.
    Evaluate {
        /// Requirement text to score.
        #[arg(long)]
        text: String,

        /// Base URL of the capability API.
        #[arg(long, env = "REQFORGE_API_BASE")]
        api_base: String,

        /// Bearer token for the capability API.
        #[arg(long, env = "REQFORGE_API_KEY")]
        api_key: Option<String>,
    },
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Dispatches a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run {
            document,
            correlation_id,
            api_base,
            api_key,
        } => commands::run(document, correlation_id, api_base, api_key).await,
        Command::Evaluate {
            text,
            api_base,
            api_key,
        } => commands::evaluate(text, api_base, api_key).await,
    }
}
