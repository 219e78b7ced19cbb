//! opencode-mcp server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use opencode_mcp::{
    config::{Config, ConfigOverrides},
    create_app_with_state, state::AppState, stdio,
};

/// opencode-mcp - MCP bridge for the opencode command-line agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen address, `host:port` or `:port`
    #[arg(long, env = "MCP_ADDR", global = true)]
    addr: Option<String>,

    /// Program to invoke
    #[arg(long, env = "MCP_TARGET", global = true)]
    target: Option<String>,

    /// Per-invocation timeout in seconds
    #[arg(long = "timeout-secs", env = "MCP_TIMEOUT_SEC", global = true)]
    timeout_secs: Option<u64>,

    /// Model used when discovery finds none of the preferred ones
    #[arg(long, env = "MCP_DEFAULT_MODEL", global = true)]
    default_model: Option<String>,

    /// Log filter, e.g. `debug` or `opencode_mcp=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Additional TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Serve MCP over HTTP (default)
    Serve,
    /// Serve MCP over stdin/stdout
    Stdio,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            addr: self.addr.clone(),
            target: self.target.clone(),
            timeout_secs: self.timeout_secs,
            default_model: self.default_model.clone(),
            log_level: self.log_level.clone(),
            config_file: self.config.clone(),
        }
    }
}

/// Initialize logging. The returned guard flushes the log file on drop.
fn init_logging(config: &Config, to_stderr: bool) -> anyhow::Result<Option<WorkerGuard>> {
    // Configured level wins over RUST_LOG; default to info
    let filter = match config.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if let Some(path) = &config.log_file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("invalid log file path: {}", path.display()))?;
        std::fs::create_dir_all(&dir)?;

        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .compact()
            .with_writer(writer)
            .init();
        return Ok(Some(guard));
    }

    if to_stderr {
        // Stdout carries the protocol
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Serve);

    let config = Config::from_figment(args.overrides())?;
    let _log_guard = init_logging(&config, command == Command::Stdio)?;
    info!("Configuration loaded");

    let state = AppState::with_process_invoker(config.bridge.clone());
    state.warm_model_cache();

    match command {
        Command::Serve => run_http(&config, state).await,
        Command::Stdio => {
            info!("Starting opencode-mcp on stdio (target: {})", config.bridge.target);
            stdio::serve(state, tokio::io::stdin(), tokio::io::stdout()).await?;
            Ok(())
        }
    }
}

async fn run_http(config: &Config, state: AppState) -> anyhow::Result<()> {
    info!(
        "Starting opencode-mcp (target: {}, timeout: {}s)",
        config.bridge.target,
        config.bridge.timeout.as_secs()
    );

    let app = create_app_with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("Server listening on {}", config.addr);

    // Set up graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shut down");
    Ok(())
}
