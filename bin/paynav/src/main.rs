mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "paynav")]
#[command(about = "Drive a browser to a utility provider's bill-payment page", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.paynav/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the navigation agent
    Run {
        /// What the agent should reach, e.g. "the guest payment page"
        #[arg(short, long)]
        goal: String,

        /// Start URL
        #[arg(short, long, conflicts_with = "site")]
        url: Option<String>,

        /// Provider name whose seed URL is configured under `sites`
        #[arg(short, long)]
        site: Option<String>,

        /// Label of the control most likely to lead to the goal
        #[arg(short, long)]
        target: String,

        /// Alternative wording for the target (repeatable)
        #[arg(long = "synonym")]
        synonyms: Vec<String>,
    },

    /// Execute one tool directly against a fresh browser session
    Tool {
        /// Tool name, e.g. open_url
        name: String,

        /// JSON arguments
        #[arg(default_value = "{}")]
        params: String,
    },

    /// List the tools advertised to the model
    Tools {
        /// Print raw function schemas
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            goal,
            url,
            site,
            target,
            synonyms,
        } => {
            let args = commands::run_cmd::RunArgs {
                goal,
                url,
                site,
                target,
                synonyms,
            };
            commands::run_cmd::run(config_path, args).await?;
        }
        Commands::Tool { name, params } => {
            commands::tools_cmd::run(config_path, &name, &params).await?;
        }
        Commands::Tools { json } => {
            commands::tools_cmd::list(json).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(config_path, force).await?;
            }
            ConfigCommands::Show => {
                commands::config_cmd::show(config_path).await?;
            }
        },
    }

    Ok(())
}
