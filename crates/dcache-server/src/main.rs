use clap::Parser;
use dcache_server::{create_api, CacheNode, ServerConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dcache")]
#[command(about = "Replicated key-value cache", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, env = "DCACHE_CONFIG", default_value = "dcache.yaml")]
    config: PathBuf,

    /// HTTP address
    #[arg(short = 'e', long = "http", env = "DCACHE_HTTP")]
    http: Option<String>,

    /// Raft TCP address
    #[arg(short = 'r', long = "raft", env = "DCACHE_RAFT")]
    raft: Option<String>,

    /// Node name
    #[arg(short = 'n', long = "node", env = "DCACHE_NODE")]
    node: Option<String>,

    /// Data folder
    #[arg(short = 'f', long = "folder", env = "DCACHE_FOLDER")]
    folder: Option<PathBuf>,

    /// Start as a new raft cluster
    #[arg(short = 'b', long = "bootstrap", env = "DCACHE_BOOTSTRAP")]
    bootstrap: bool,

    /// HTTP address of a cluster member to join
    #[arg(short = 'j', long = "join", env = "DCACHE_JOIN")]
    join: Option<String>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, env = "DCACHE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long, env = "DCACHE_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(http) = self.http {
            config.node.http_addr = http;
        }
        if let Some(raft) = self.raft {
            config.node.raft_addr = raft;
        }
        if let Some(node) = self.node {
            config.node.id = node;
        }
        if let Some(folder) = self.folder {
            config.node.data_dir = Some(folder);
        }
        if self.bootstrap {
            config.node.bootstrap = true;
        }
        if let Some(join) = self.join {
            config.node.join = Some(join);
        }
        if let Some(level) = self.log_level {
            config.monitoring.log_level = level;
        }
        if self.json_logs {
            config.monitoring.json_logs = true;
        }
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.monitoring.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };
    args.apply(&mut config);

    init_tracing(&config);
    if !config_found {
        tracing::warn!("Config file not found, using defaults");
    }
    tracing::info!("Starting dcache with config: {:?}", config);

    let node = CacheNode::start(config.clone()).await?;
    let app = create_api(node.clone());

    let listener = tokio::net::TcpListener::bind(&config.node.http_addr).await?;
    tracing::info!("HTTP API listening on {}", config.node.http_addr);

    let stopped = node.stopped();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received shutdown signal"),
                _ = stopped.cancelled() => tracing::warn!("Node stopped"),
            }
        })
        .await?;

    node.shutdown().await?;
    Ok(())
}
