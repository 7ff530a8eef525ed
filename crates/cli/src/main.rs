use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use warden_sandbox::Sandbox;

#[derive(Parser)]
#[command(name = "warden", about = "Warden — per-sandbox control plane, edge router, and bridge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Tracing filter used when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines for log shippers rather than pretty output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Path to warden.toml (overrides discovery).
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for the selected component, overriding the config file.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Listen port for the selected component, overriding the config file.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Workspace root for commands and files (sandbox mode).
    #[arg(long, global = true, env = "WARDEN_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Bearer API key for the bridge.
    #[arg(long, global = true, env = "WARDEN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the in-container control plane (default when no subcommand given).
    Sandbox,
    /// Run the edge router.
    Edge,
    /// Run the Bearer-authenticated bridge.
    Bridge,
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut cfg = match &cli.config {
        Some(path) => warden_config::load_config(path)?,
        None => warden_config::discover_and_load(),
    };
    if let Some(workspace) = &cli.workspace {
        cfg.sandbox.workspace_root = workspace.display().to_string();
    }
    if let Some(api_key) = &cli.api_key {
        cfg.bridge.api_key = api_key.clone();
    }

    match cli.command.unwrap_or(Commands::Sandbox) {
        Commands::Sandbox => {
            if let Some(bind) = cli.bind {
                cfg.sandbox.bind = bind;
            }
            if let Some(port) = cli.port {
                cfg.sandbox.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "starting sandbox control plane");
            let sandbox = Sandbox::new(cfg).await?;
            sandbox.serve().await
        },
        Commands::Edge => {
            if let Some(bind) = cli.bind {
                cfg.edge.bind = bind;
            }
            if let Some(port) = cli.port {
                cfg.edge.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "starting edge router");
            warden_edge::serve(cfg.edge).await
        },
        Commands::Bridge => {
            if let Some(bind) = cli.bind {
                cfg.bridge.bind = bind;
            }
            if let Some(port) = cli.port {
                cfg.bridge.port = port;
            }
            info!(version = env!("CARGO_PKG_VERSION"), "starting bridge");
            warden_bridge::serve(cfg.bridge, cfg.edge.sandbox_origin_template).await
        },
    }
}
