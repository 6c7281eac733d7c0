//! relaymesh - clustered reverse-tunnel proxy
//!
//! Run a node, run an agent that registers local services with a node, or
//! issue upstream tokens.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relaymesh_agent::{Agent, AgentConfig, EndpointConfig};
use relaymesh_auth::{EndpointClaims, JwtVerifier};
use relaymesh_server::{Node, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// relaymesh - expose services behind NAT through a cluster of proxy nodes
#[derive(Parser, Debug)]
#[command(name = "relaymesh")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "RELAYMESH_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a proxy node
    #[command(long_about = r#"
Run a relaymesh node. The node listens on three addresses: the proxy
listener for external HTTP clients, the upstream listener where agents
register endpoints, and the admin listener used by peer nodes.

EXAMPLES:
  # Single node, no authentication
  relaymesh server

  # Two-node cluster with JWT authentication
  relaymesh server --node-id node-a --jwt-secret $SECRET \
    --peer node-b=10.0.0.2:8002
"#)]
    Server(ServerArgs),

    /// Register local services with a node
    #[command(long_about = r#"
Connect to a node's upstream listener and serve one or more endpoints by
forwarding their requests to local HTTP services. Reconnects with
exponential backoff when the connection drops.

EXAMPLES:
  relaymesh agent --server-url ws://relay.example.com:8001 \
    --token $TOKEN --endpoint my-api=127.0.0.1:3000
"#)]
    Agent(AgentArgs),

    /// Issue a JWT permitting endpoints to register
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// YAML config file
    #[arg(long, short, env = "RELAYMESH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "RELAYMESH_PROXY_BIND_ADDR")]
    proxy_bind_addr: Option<String>,

    #[arg(long, env = "RELAYMESH_UPSTREAM_BIND_ADDR")]
    upstream_bind_addr: Option<String>,

    #[arg(long, env = "RELAYMESH_ADMIN_BIND_ADDR")]
    admin_bind_addr: Option<String>,

    /// Address peers use to reach this node's admin listener
    #[arg(long, env = "RELAYMESH_ADMIN_ADVERTISE_ADDR")]
    admin_advertise_addr: Option<String>,

    /// Gateway timeout in seconds
    #[arg(long, env = "RELAYMESH_GATEWAY_TIMEOUT")]
    gateway_timeout: Option<u64>,

    #[arg(long, env = "RELAYMESH_NODE_ID")]
    node_id: Option<String>,

    /// Peer node as node_id=admin_addr (repeatable)
    #[arg(long = "peer", env = "RELAYMESH_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// HS256 secret for upstream tokens
    #[arg(long, env = "RELAYMESH_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "RELAYMESH_GRACEFUL_SHUTDOWN_TIMEOUT")]
    graceful_shutdown_timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// YAML config file
    #[arg(long, short, env = "RELAYMESH_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream listener base URL (ws:// or wss://)
    #[arg(long, env = "RELAYMESH_SERVER_URL")]
    server_url: Option<String>,

    #[arg(long, env = "RELAYMESH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Endpoint as id=host:port (repeatable)
    #[arg(long = "endpoint", env = "RELAYMESH_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Timeout for requests to local services in seconds
    #[arg(long)]
    forward_timeout: Option<u64>,

    /// Maximum reconnection delay in seconds
    #[arg(long)]
    max_backoff: Option<u64>,
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// HS256 secret
    #[arg(long, env = "RELAYMESH_JWT_SECRET", hide_env_values = true, conflicts_with = "rsa_private_key")]
    secret: Option<String>,

    /// RS256 private key in PEM format
    #[arg(long)]
    rsa_private_key: Option<PathBuf>,

    /// Endpoint the token permits (repeatable, "*" for all)
    #[arg(long = "endpoint", required = true)]
    endpoints: Vec<String>,

    /// Lifetime in seconds; omit for a token that never expires
    #[arg(long)]
    ttl_secs: Option<i64>,

    #[arg(long, default_value = "relaymesh-agent")]
    subject: String,

    #[arg(long)]
    issuer: Option<String>,

    #[arg(long)]
    audience: Option<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

fn server_config(args: ServerArgs) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(addr) = args.proxy_bind_addr {
        config.proxy.bind_addr = addr;
    }
    if let Some(addr) = args.upstream_bind_addr {
        config.upstream.bind_addr = addr;
    }
    if let Some(addr) = args.admin_bind_addr {
        config.admin.bind_addr = addr;
    }
    if let Some(addr) = args.admin_advertise_addr {
        config.admin.advertise_addr = Some(addr);
    }
    if let Some(secs) = args.gateway_timeout {
        config.proxy.gateway_timeout = Duration::from_secs(secs);
    }
    if let Some(node_id) = args.node_id {
        config.cluster.node_id = Some(node_id);
        config.cluster.node_id_prefix = None;
    }
    if !args.peers.is_empty() {
        config.cluster.peers = args.peers;
    }
    if let Some(secret) = args.jwt_secret {
        let auth = config.auth.get_or_insert_with(Default::default);
        auth.jwt_secret = Some(secret);
        auth.jwt_rsa_public_key = None;
    }
    if let Some(secs) = args.graceful_shutdown_timeout {
        config.server.graceful_shutdown_timeout = Duration::from_secs(secs);
    }

    config.validate().context("Invalid server configuration")?;
    Ok(config)
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = server_config(args)?;

    let node = Node::bind(config).await.context("Failed to start node")?;
    let addrs = node.addrs()?;
    info!(
        "Node {} listening: proxy {}, upstream {}, admin {}",
        node.node_id(),
        addrs.proxy,
        addrs.upstream,
        addrs.admin
    );

    let running = node.serve();
    shutdown_signal().await?;
    running.shutdown().await;
    Ok(())
}

fn agent_config(args: AgentArgs) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };

    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if args.token.is_some() {
        config.token = args.token;
    }
    if !args.endpoints.is_empty() {
        config.endpoints = args
            .endpoints
            .iter()
            .map(|e| e.parse::<EndpointConfig>())
            .collect::<Result<_, _>>()?;
    }
    if let Some(secs) = args.forward_timeout {
        config.forward_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.max_backoff {
        config.max_backoff = Duration::from_secs(secs);
    }

    Ok(config)
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let agent = Agent::new(agent_config(args)?).context("Invalid agent configuration")?;
    info!(
        "Agent serving {} endpoint(s) via {}",
        agent.config().endpoints.len(),
        agent.config().server_url
    );

    let cancel = CancellationToken::new();
    let run = agent.run(cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result.context("Agent stopped"),
        signal = shutdown_signal() => signal?,
    }

    cancel.cancel();
    run.await.context("Agent stopped")
}

fn issue_token(args: TokenArgs) -> Result<()> {
    let mut claims = EndpointClaims::new(args.subject).with_endpoints(args.endpoints);
    if let Some(ttl) = args.ttl_secs {
        claims = claims.with_validity(chrono::Duration::seconds(ttl));
    }
    if let Some(issuer) = args.issuer {
        claims = claims.with_issuer(issuer);
    }
    if let Some(audience) = args.audience {
        claims = claims.with_audience(audience);
    }

    let token = match (args.secret, args.rsa_private_key) {
        (Some(secret), None) => JwtVerifier::encode(secret.as_bytes(), &claims)?,
        (None, Some(path)) => {
            let pem = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            JwtVerifier::encode_rsa(&pem, &claims)?
        }
        _ => anyhow::bail!("Exactly one of --secret or --rsa-private-key is required"),
    };

    println!("{}", token);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
        Commands::Token(args) => issue_token(args),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
