use clap::Parser;
use sharded_search::api;
use sharded_search::config::{LogConfig, NodeConfig};
use sharded_search::directory::remote::HttpMetadataStore;
use sharded_search::directory::service::ClusterDirectory;
use sharded_search::directory::store::{MemoryMetadataStore, MetadataStore};
use sharded_search::directory::types::NodeId;
use sharded_search::index::engine::MemoryIndexFactory;
use sharded_search::node::SearchNode;
use sharded_search::retry::RetryPolicy;
use sharded_search::transport::http::HttpTransport;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// One node of a sharded search cluster.
#[derive(Debug, Parser)]
#[command(name = "shard-node", version)]
struct Args {
    /// Stable identity of this node. Generated when omitted.
    #[arg(long)]
    node_id: Option<String>,

    /// HTTP address for clients and peers.
    #[arg(long, default_value = "127.0.0.1:7000")]
    bind: SocketAddr,

    /// Node that hosts the metadata store. Omit to host it on this node.
    #[arg(long)]
    directory: Option<SocketAddr>,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref())?;
    init_tracing(&config.log);

    let node_id = args.node_id.map(NodeId).unwrap_or_default();
    tracing::info!("Starting node {} on {}", node_id, args.bind);

    // 1. Metadata store: hosted here, or reached over HTTP
    let retry = RetryPolicy::from_config(&config.retry);
    let (store, hosted): (Arc<dyn MetadataStore>, Option<Arc<dyn MetadataStore>>) = match args.directory {
        Some(host) => {
            tracing::info!("Using metadata store hosted by {}", host);
            let remote = HttpMetadataStore::new(host, config.query.deadline());
            remote.spawn_watcher(config.cluster.directory_poll());
            let remote: Arc<dyn MetadataStore> = remote;
            (remote, None)
        }
        None => {
            tracing::info!("Hosting the metadata store on this node");
            let local: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
            (local.clone(), Some(local))
        }
    };
    let directory = Arc::new(ClusterDirectory::new(store, retry));

    // 2. Node components
    let transport = Arc::new(HttpTransport::new(
        directory.clone(),
        retry,
        config.replication.write_timeout(),
    ));
    let node = SearchNode::new(
        node_id,
        args.bind,
        config,
        directory,
        transport,
        Arc::new(MemoryIndexFactory),
    );

    // 3. Register before serving so peers can resolve this node
    node.heartbeat().await?;
    let _loops = node.start();

    // 4. HTTP server
    let app = api::router(node.clone(), hosted);
    tracing::info!("HTTP server listening on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    if log.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
