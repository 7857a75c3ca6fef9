// tasyncd - runnable host for the sync engine
//
// Loads configuration, builds the engine, and drives reconciliation
// for every project known to the local store until interrupted.

use std::path::PathBuf;
use tasksync::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match load_config().await {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let engine = match tasksync::build(config.clone()).await {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to start sync engine: {err}");
            std::process::exit(1);
        }
    };

    tracing::info!(url = %config.server.url, "tasyncd started");
    // "inbox" is the only project guaranteed to exist before this
    // process has handled a single request; every other project the
    // coordinator discovers (a `create_task`/`list_tasks` call, or an
    // unknown-id push event) joins the periodic and reconnect triggers
    // automatically from then on.
    engine.run(&["inbox".to_string()], config.sync.interval).await;
}

async fn load_config() -> tasksync::Result<Config> {
    let path = config_path();
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        Config::from_file(&path).await
    } else {
        Ok(Config::default())
    }
}

fn config_path() -> PathBuf {
    std::env::var_os("TASYNCD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tasyncd.toml"))
}
