//! `nexus3` — the agent-runtime daemon. Loads configuration, builds the
//! shared pool of provider/tool/MCP resources, binds the loopback-only
//! JSON-RPC transport, and serves until `shutdown_server` or a signal
//! tells it to stop.

mod agent;
mod context;
mod pool;
mod registry;
mod transport;
mod turn;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nexus3_domain::config::{Config, ConfigSeverity};
use nexus3_mcp::McpManager;
use nexus3_providers::{LlmRouter, ProviderRegistry};
use nexus3_tools::manager::ProcessManager;

use pool::{AgentPool, PoolResources};
use registry::ToolRegistry;
use transport::TransportState;

#[derive(Parser)]
#[command(name = "nexus3", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file. Defaults to `./nexus3.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent-runtime server (default).
    Serve {
        /// Override the configured RPC port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Load and validate the config, reporting errors/warnings, then exit.
    Doctor,
    /// Print the effective config as TOML.
    ConfigShow,
    /// Drive an already-running server's JSON-RPC transport over HTTP.
    Rpc {
        #[command(subcommand)]
        action: RpcAction,
    },
}

/// One subcommand per JSON-RPC method the transport (spec §4.12) exposes —
/// every variant here is exactly one HTTP round trip, nothing more.
#[derive(Subcommand)]
enum RpcAction {
    /// Create a new agent.
    Create {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        preset: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long = "disable-tool")]
        disable_tools: Vec<String>,
    },
    /// List all live agents.
    List,
    /// Destroy an agent.
    Destroy { id: String },
    /// Send a message to an agent and wait for its reply.
    Send { id: String, message: String },
    /// Cancel an agent's in-flight request.
    Cancel { id: String, request_id: String },
    /// Report an agent's current token budget usage.
    Status { id: String },
    /// Trigger compaction on an agent's context log.
    Compact { id: String },
    /// Record an MCP per-tool/per-server consent choice.
    Consent {
        id: String,
        server: String,
        tool: String,
        /// One of: once, this_tool_always, this_server_always, deny.
        choice: String,
    },
    /// Shut down one agent, or the whole server if no id is given.
    Shutdown { id: Option<String> },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nexus3_core=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let path = path.cloned().unwrap_or_else(|| PathBuf::from("nexus3.toml"));
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no config file found, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(toml::from_str(&raw)?)
}

fn validate_or_bail(config: &Config) -> anyhow::Result<()> {
    let issues = config.validate();
    let mut has_error = false;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => {
                has_error = true;
                tracing::error!(field = %issue.field, "{}", issue.message);
            }
            ConfigSeverity::Warning => {
                tracing::warn!(field = %issue.field, "{}", issue.message);
            }
        }
    }
    if has_error {
        anyhow::bail!("configuration is invalid, refusing to start");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await
        }
        Command::Doctor => {
            validate_or_bail(&config)?;
            println!("configuration OK");
            Ok(())
        }
        Command::ConfigShow => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Rpc { action } => run_rpc_command(&config, action).await,
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    validate_or_bail(&config)?;
    let config = Arc::new(config);

    let provider_registry =
        Arc::new(ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?);
    let router = Arc::new(LlmRouter::new(provider_registry.clone(), &config.llm));

    let processes = Arc::new(ProcessManager::new(config.tools.exec.clone()));

    let mcp = Arc::new(if config.mcp.servers.is_empty() {
        McpManager::empty()
    } else {
        McpManager::from_config(&config.mcp).await
    });

    let registry = Arc::new(ToolRegistry::new(mcp.clone(), processes.clone()));

    let resources = PoolResources {
        config: config.clone(),
        router,
        mcp: mcp.clone(),
        registry,
        processes: processes.clone(),
    };
    let pool = Arc::new(AgentPool::new(resources));

    let token_dir = dirs::config_dir().unwrap_or_else(std::env::temp_dir).join("nexus3");
    let auth_token =
        transport::write_token_file(&token_dir, config.server.port).context("writing rpc auth token file")?;
    tracing::info!(dir = %token_dir.display(), port = config.server.port, "wrote rpc auth token file");

    let state = TransportState {
        pool: pool.clone(),
        auth_token: Arc::from(auth_token.as_str()),
    };
    let router = transport::build_router(state);

    spawn_background_tasks(processes.clone());

    transport::serve(&config.server, router).await.context("axum server error")?;
    Ok(())
}

/// A thin HTTP client for the `rpc` subcommand — reads the bearer token
/// this same binary's `serve` wrote to disk, then issues one JSON-RPC
/// call per invocation against the already-running server.
async fn run_rpc_command(config: &Config, action: RpcAction) -> anyhow::Result<()> {
    let token_dir = dirs::config_dir().unwrap_or_else(std::env::temp_dir).join("nexus3");
    let token_path = token_dir.join(format!("rpc-{}.token", config.server.port));
    let token = std::fs::read_to_string(&token_path).map_err(|e| {
        anyhow::anyhow!("could not read rpc token at {}: {e} (is the server running?)", token_path.display())
    })?;
    let base = format!("http://{}:{}", config.server.host, config.server.port);
    let client = reqwest::Client::new();

    let (path, method, params) = match action {
        RpcAction::Create { id, preset, system_prompt, disable_tools } => (
            "/rpc".to_string(),
            "create_agent",
            serde_json::json!({ "id": id, "preset": preset, "system_prompt": system_prompt, "disable_tools": disable_tools }),
        ),
        RpcAction::List => ("/rpc".to_string(), "list_agents", serde_json::json!({})),
        RpcAction::Destroy { id } => ("/rpc".to_string(), "destroy_agent", serde_json::json!({ "id": id })),
        RpcAction::Send { id, message } => (format!("/agent/{id}"), "send", serde_json::json!({ "content": message })),
        RpcAction::Cancel { id, request_id } => {
            (format!("/agent/{id}"), "cancel", serde_json::json!({ "request_id": request_id }))
        }
        RpcAction::Status { id } => (format!("/agent/{id}"), "get_tokens", serde_json::json!({})),
        RpcAction::Compact { id } => (format!("/agent/{id}"), "compact", serde_json::json!({})),
        RpcAction::Consent { id, server, tool, choice } => (
            format!("/agent/{id}"),
            "grant_mcp_consent",
            serde_json::json!({ "server": server, "tool": tool, "choice": choice }),
        ),
        RpcAction::Shutdown { id: Some(id) } => (format!("/agent/{id}"), "shutdown", serde_json::json!({})),
        RpcAction::Shutdown { id: None } => ("/rpc".to_string(), "shutdown_server", serde_json::json!({})),
    };

    let body = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let response = client
        .post(format!("{base}{path}"))
        .bearer_auth(token.trim())
        .json(&body)
        .send()
        .await?;
    let value: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Periodic maintenance mirroring the cadence the teacher's gateway used
/// for its own background sweeps: stale process-session cleanup so
/// finished `exec` sessions don't accumulate forever.
fn spawn_background_tasks(processes: Arc<ProcessManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            processes.cleanup_stale();
        }
    });
}
