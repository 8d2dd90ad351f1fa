mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "concord")]
#[command(about = "Multi-agent personal assistant with intent routing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Onboard {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and provider status
    Status,

    /// Talk to the orchestrator
    Chat {
        /// Message to send (interactive mode if not provided)
        #[arg(short, long)]
        message: Option<String>,

        /// Session ID
        #[arg(short, long, default_value = "cli:default")]
        session: String,

        /// Print the routing rationale as JSON after each answer
        #[arg(long)]
        explain: bool,
    },

    /// Classify a message without answering it
    Route {
        /// Text to classify
        text: String,

        /// Also consult the model classifier
        #[arg(long)]
        model: bool,
    },

    /// Inspect the agent ecosystem
    Agents {
        #[command(subcommand)]
        command: AgentsCommands,
    },
}

#[derive(Subcommand)]
enum AgentsCommands {
    /// List agents with their capabilities
    List,
    /// Run a health check over all agents
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Chat {
            message,
            session,
            explain,
        } => {
            commands::chat::run(message, session, explain).await?;
        }
        Commands::Route { text, model } => {
            commands::route::run(&text, model).await?;
        }
        Commands::Agents { command } => match command {
            AgentsCommands::List => commands::agents::list().await?,
            AgentsCommands::Health => commands::agents::health().await?,
        },
    }

    Ok(())
}
