use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use movies_sync::config;
use movies_sync::connector::ConnectorFactory;
use movies_sync::db::{self, QuerySet};
use movies_sync::state::{BookmarkStore, RedisStateStore};
use movies_sync::sync::{self, Syncer};

#[derive(Debug, Parser)]
#[command(author, version, about = "Replicate movies from Postgres into Elasticsearch")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Overwrite the stored bookmark with the configured initial values first
    #[arg(long)]
    reset_bookmark: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let shutdown = sync::interrupt().await;
    let cfg = Arc::new(config::load(Some(&args.config)).context("failed to load config")?);

    let factory = ConnectorFactory::new(cfg.clone());
    let reader = db::reader_for(&factory)?;
    let index = factory.connect_index().await?;
    let state = RedisStateStore::new(factory.clone());
    let bookmarks = BookmarkStore::new(&state, cfg.app.state_key.clone(), cfg.app.initial_bookmark());

    if args.reset_bookmark {
        bookmarks.reset().await?;
    }

    let syncer = Syncer::new(
        reader.as_ref(),
        &index,
        bookmarks,
        QuerySet::new(&cfg.source.query_path),
        cfg.app.chunk_size,
    );

    info!(
        source = %cfg.source.connector,
        index = %index.index_name(),
        chunk_size = cfg.app.chunk_size,
        "starting movies sync"
    );

    if args.once {
        let report = syncer.run_cycle().await?;
        info!(
            rows = report.rows,
            upserted = report.upserted,
            rejected = report.rejected,
            failed = report.failed,
            last_id = %report.end.last_id,
            "single cycle complete"
        );
        return Ok(());
    }

    syncer.run_until(cfg.app.poll_interval(), shutdown).await?;

    info!("movies sync stopped");
    Ok(())
}
