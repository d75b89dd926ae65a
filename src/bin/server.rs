use std::sync::Arc;

use clap::Parser;
use poolsync::{
    config::{ServerConfig, StorageConfig, read_config_file},
    server::spawn_server,
    storage::{ConfigStore, MemoryConfigStore},
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("poolsync", LevelFilter::DEBUG),
        ("server", LevelFilter::TRACE),
        ("tower_http", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

async fn open_store(config: Option<&StorageConfig>) -> anyhow::Result<Arc<dyn ConfigStore>> {
    match config {
        None | Some(StorageConfig::None) => {
            warn!("using in-memory storage, configuration is lost on restart");
            Ok(Arc::new(MemoryConfigStore::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path }) => {
            info!("opening sqlite storage at {}", path.display());
            let store = poolsync::storage::sqlite::SqliteConfigStore::new(path).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            anyhow::bail!("sqlite storage requested but the storage-sqlite feature is disabled")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file::<ServerConfig>(&args.file)?.with_env_overrides();
    let store = open_store(config.storage.as_ref()).await?;

    let handle = spawn_server(config.settings(), Arc::clone(&store)).await?;
    info!("serving on {}", handle.base_url());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown();
    store.close().await?;

    Ok(())
}
