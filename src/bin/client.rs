use std::time::Duration;

use clap::Parser;
use poolsync::{
    alarm::Notifiers,
    client::ClientContext,
    config::{ClientConfig, read_config_file},
    executor::ExecutorBuilder,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

/// How long queued tasks may run after ctrl-c
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("poolsync", LevelFilter::DEBUG),
        ("client", LevelFilter::TRACE),
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file::<ClientConfig>(&args.file)?.with_env_overrides();
    let pools = config.resolve_pools()?;

    let mut client = ClientContext::new(config.settings(), Notifiers::with_defaults())?;
    for (key, pool) in pools {
        let builder = ExecutorBuilder::new(key.pool_id()).parameters(pool.parameters);
        if let Err(e) = client.register_pool(builder, pool.alarm).await {
            error!(pool = %key, "registration failed: {e}");
        }
    }

    client.start();
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    if !client.shutdown(SHUTDOWN_GRACE).await {
        error!("some pools did not finish their queued work in time");
    }

    Ok(())
}
