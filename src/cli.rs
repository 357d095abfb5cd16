//! Command-line entry points.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use crate::config::ServerConfig;

/// Exit code when required configuration is missing.
pub const EXIT_CONFIG: i32 = 64;
/// Exit code for an unrecoverable agent failure after repeated restarts.
pub const EXIT_AGENT_FAILURE: i32 = 70;

#[derive(Parser)]
#[command(name = "voice-relay", version, about = "Voice-to-agent relay server")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (the default).
    Serve(ServeArgs),
    /// Print the effective configuration and exit.
    ShowConfig(ServeArgs),
}

#[derive(Args, Clone, Default)]
struct ServeArgs {
    /// HTTP API port.
    #[arg(long, env = "PORT_HTTP")]
    http_port: Option<u16>,
    /// WebSocket port.
    #[arg(long, env = "PORT_WS")]
    ws_port: Option<u16>,
    /// Working directory handed to the agent child.
    #[arg(long, env = "WORK_DIR")]
    work_dir: Option<PathBuf>,
    /// Speech API credential.
    #[arg(long, env = "STT_API_KEY", hide_env_values = true)]
    stt_api_key: Option<String>,
    /// Comma-separated node identities allowed to connect.
    #[arg(long, env = "ALLOWED_NODES", value_delimiter = ',')]
    allowed_nodes: Option<Vec<String>>,
    /// Configuration file path.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Agent child command.
    #[arg(long)]
    agent_command: Option<String>,
}

/// Parse arguments and dispatch.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let settings = load_settings(&args, true);
            crate::server::run(settings).await
        }
        Commands::ShowConfig(args) => {
            let settings = load_settings(&args, false);
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// File settings layered under env/CLI overrides. Missing required
/// configuration exits with code 64.
fn load_settings(args: &ServeArgs, require_key: bool) -> ServerConfig {
    let mut settings = match ServerConfig::load(args.config.as_ref()) {
        Ok(settings) => settings,
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Some(port) = args.http_port {
        settings.http_port = port;
    }
    if let Some(port) = args.ws_port {
        settings.ws_port = port;
    }
    if let Some(dir) = &args.work_dir {
        settings.work_dir = dir.clone();
    }
    if let Some(key) = &args.stt_api_key {
        settings.stt_api_key = key.clone();
    }
    if let Some(nodes) = &args.allowed_nodes {
        settings.allowed_nodes = nodes.clone();
    }
    if let Some(command) = &args.agent_command {
        settings.agent.command = command.clone();
    }

    if require_key && settings.stt_api_key.is_empty() {
        error!("STT_API_KEY is required");
        std::process::exit(EXIT_CONFIG);
    }

    settings
}
