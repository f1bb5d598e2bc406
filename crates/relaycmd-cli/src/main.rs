//! relaycmd: remote command channels over a relay.
//!
//! `listen` keeps a channel open and runs the built-in commands other peers
//! send; `send` delivers a single command to a peer.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::Settings;
use std::path::PathBuf;
use tracing::error;

/// relaycmd: remote command channels over a relay
#[derive(Parser)]
#[command(name = "relaycmd", version, about = "Send and receive remote commands over a relay")]
struct Cli {
    /// Relay URL (ws:// or wss://)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Identity to register as (defaults to the token's user)
    #[arg(long = "as", global = true)]
    identity: Option<String>,

    /// Environment variable holding the bearer token
    #[arg(long, global = true)]
    token_env: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the built-in commands until Ctrl+C
    Listen {
        /// Only accept commands from these user ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,
    },

    /// Send one command to a peer
    Send {
        /// Recipient user id
        #[arg(long, conflicts_with = "to_phone", required_unless_present = "to_phone")]
        to_user: Option<String>,

        /// Recipient phone number
        #[arg(long)]
        to_phone: Option<String>,

        /// Command name
        command: String,

        /// Command parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("relaycmd=debug,relaycmd_cli=debug,relaycmd_client=debug,relaycmd_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("relaycmd=info,relaycmd_cli=info,relaycmd_client=warn")
            .with_target(false)
            .init();
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(config::Config::default_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("relaycmd: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI overrides config.
    let settings = Settings {
        url: cli.url.clone().unwrap_or_else(|| cfg.default.url.clone()),
        identity: cli.identity.clone().or_else(|| cfg.identity()),
        token_env: cli
            .token_env
            .clone()
            .unwrap_or_else(|| cfg.default.token_env.clone()),
    };

    let result = match cli.command {
        Command::Listen { allow } => commands::listen::run(&settings, &allow).await,
        Command::Send {
            to_user,
            to_phone,
            command,
            params,
        } => {
            match (
                commands::send::target(to_user, to_phone),
                commands::send::parse_params(params.as_deref()),
            ) {
                (Ok(target), Ok(params)) => {
                    commands::send::run(&settings, target, &command, params).await
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("relaycmd: {e:#}");
        std::process::exit(1);
    }
}
