use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_client::{OpenRouter, StreamLimits};
use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tweetfilter_common::{Config, JsonFileStore, KeyValueStore, RatingState};
use tweetfilter_engine::{
    CompletionDescriber, DisabledDescriber, FeedView, MediaDescriber, RatingCache,
    RatingScheduler, RelationshipTable, SchedulerDeps, SnapshotView,
};

#[derive(Parser)]
#[command(name = "tweetfilter", about = "Rate feed posts with a language model")]
struct Cli {
    /// Path to config TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON snapshot of the rendered feed
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// JSON key-value file for ratings and thread relationships
    #[arg(long)]
    store: Option<PathBuf>,

    /// Rate what is visible once, print the results and exit
    #[arg(long)]
    once: bool,

    /// Print cache statistics
    #[arg(long)]
    cache_stats: bool,

    /// Drop interrupted cache entries
    #[arg(long)]
    cleanup: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(store) = &cli.store {
        config.storage.path = store.clone();
    }
    config.log_summary();

    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&config.storage.path)?);
    let cache = RatingCache::load(store.clone(), config.timing.cache_flush());

    if cli.cleanup {
        let stats = cache.cleanup();
        println!("cleanup: deleted {} remaining {}", stats.deleted, stats.remaining);
    }
    if cli.cache_stats {
        println!("cached ratings: {}", cache.count());
    }

    let Some(snapshot) = &cli.snapshot else {
        if cli.cleanup || cli.cache_stats {
            return Ok(());
        }
        bail!("--snapshot is required unless only --cache-stats or --cleanup is given");
    };

    let view = Arc::new(SnapshotView::open(snapshot)?);
    view.log_summary();

    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None => {
            warn!("OPENROUTER_API_KEY is not set, every rating will fail");
            String::new()
        }
    };
    let client = Arc::new(
        OpenRouter::new(api_key)
            .with_app_name("TweetFilter-AI")
            .with_request_timeout(config.timing.request_timeout())
            .with_stream_limits(StreamLimits {
                overall: config.timing.stream_timeout(),
                inactivity: config.timing.inactivity_timeout(),
                ..StreamLimits::default()
            }),
    );

    let describer: Arc<dyn MediaDescriber> = if config.rating.describe_images {
        Arc::new(
            CompletionDescriber::new(client.clone(), config.model.image_model.clone())
                .with_sampling(config.model.temperature, config.model.top_p),
        )
    } else {
        Arc::new(DisabledDescriber)
    };

    let config = Arc::new(config);
    let scheduler = RatingScheduler::new(
        SchedulerDeps::builder()
            .config(config.clone())
            .cache(cache)
            .relationships(RelationshipTable::load(store))
            .view(view.clone())
            .client(client)
            .describer(describer)
            .build(),
    );

    if cli.once {
        return rate_once(&scheduler, view.as_ref(), &config).await;
    }

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.status.is_final() || event.status == RatingState::Error => {
                    info!(
                        item_id = %event.item_id,
                        status = %event.status,
                        score = ?event.score.map(|s| s.value()),
                        "Item updated"
                    );
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let reload_view = view.clone();
    let reload_every = config.timing.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reload_every);
        loop {
            interval.tick().await;
            if let Err(e) = reload_view.reload() {
                warn!(error = %e, "Snapshot reload failed, keeping the last render");
            }
        }
    });

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

/// Rate every visible item, wait for each to settle, print one line per item.
async fn rate_once(scheduler: &RatingScheduler, view: &dyn FeedView, config: &Config) -> Result<()> {
    scheduler.tick().await;

    let timing = &config.timing;
    let per_item = timing.stream_timeout() + timing.backoff(timing.max_retries);
    let deadline = tokio::time::Instant::now() + per_item * timing.max_retries.max(1);

    let items = view.visible_items();
    loop {
        let settled = items.iter().all(|item| {
            scheduler
                .record(&item.id)
                .map(|r| r.state.is_final() || r.state == RatingState::Error)
                .unwrap_or(false)
        });
        if settled {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Gave up waiting for ratings");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.sweep();
    }

    for item in &items {
        match scheduler.record(&item.id) {
            Some(record) => println!(
                "{}\t@{}\t{}\t{}",
                item.id,
                item.author,
                record.state,
                record
                    .score
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
            None => println!("{}\t@{}\tunrated\t-", item.id, item.author),
        }
    }

    scheduler.shutdown();
    Ok(())
}
