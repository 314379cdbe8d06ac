use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use movies_sync::config;
use movies_sync::connector::ConnectorFactory;
use movies_sync::state::{BookmarkStore, RedisStateStore, StateStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Show or reset the stored replication bookmark")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Write the configured initial bookmark instead of printing
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = Arc::new(config::load(Some(&args.config))?);
    let state = RedisStateStore::new(ConnectorFactory::new(cfg.clone()));
    let bookmarks = BookmarkStore::new(&state, cfg.app.state_key.clone(), cfg.app.initial_bookmark());

    if args.reset {
        let bookmark = bookmarks.reset().await?;
        println!("Reset {} to {} @ {}", bookmarks.key(), bookmark.last_id, bookmark.last_updated_at);
        return Ok(());
    }

    match state.get(bookmarks.key()).await? {
        Some(_) => {
            let bookmark = bookmarks.load().await?;
            println!("Key: {}", bookmarks.key());
            println!("  id:         {}", bookmark.last_id);
            println!("  updated_at: {}", bookmark.last_updated_at.to_rfc3339());
        }
        None => println!("Key {} is not set; next run starts from the initial bookmark", bookmarks.key()),
    }
    Ok(())
}
