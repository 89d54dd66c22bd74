//! Codenav MCP Server
//!
//! Serves code navigation tools to MCP clients over JSON-RPC and SSE.

use anyhow::{anyhow, Context};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use codenav_mcp::config::{Args, Config};
use codenav_mcp::http::{AppState, HttpServer};
use codenav_mcp::mcp::handler::InMemoryToolRegistry;
use codenav_mcp::mcp::router::WorkspaceRegistry;
use codenav_mcp::tools;
use codenav_mcp::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Build configuration from args
    let config: Config = args.into();
    init_logging(&config)?;

    info!("Codenav MCP Server v{}", VERSION);

    let workspaces = Arc::new(WorkspaceRegistry::new());
    for project in config.project_roots()? {
        workspaces
            .register(&project)
            .with_context(|| format!("Failed to register project {}", project.display()))?;
    }
    info!("Registered {} projects", workspaces.len());

    let registry = Arc::new(InMemoryToolRegistry::new());
    tools::register_builtin_tools(registry.as_ref()).context("Failed to register tools")?;
    info!("Registered {} MCP tools", registry.tool_count());

    let state = AppState::new(&config, workspaces, registry);
    let server = HttpServer::start(&config, state)
        .await
        .with_context(|| format!("Failed to start server on {}", config.bind_addr()))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    server.stop().await;

    Ok(())
}

/// `RUST_LOG` wins over `--debug`.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = if config.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(true).with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to set tracing subscriber: {}", e))
}
