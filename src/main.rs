use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use reqwest::redirect::Policy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use feedwarden::config::{Config, RestartPolicy};
use feedwarden::content::{HttpTransport, ResourceCache, RetryingDownloader};
use feedwarden::engine::Engine;
use feedwarden::feed::FeedFetcher;
use feedwarden::scheduler::Scheduler;
use feedwarden::sink::{DeliverySink, JsonLinesSink, LogSink};
use feedwarden::storage::{Database, DatabaseError, WatermarkStore};

/// Get the default config file path (~/.config/feedwarden/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedwarden")
        .join("config.toml"))
}

/// Follow at most 3 redirects and refuse loops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Output {
    /// Log each delivered item
    Log,
    /// Write delivered items to stdout as JSON lines
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(
    name = "feedwarden",
    about = "Incremental feed poller with watermark tracking and a resource cache"
)]
struct Args {
    /// Config file (default: ~/.config/feedwarden/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run one cycle per source kind and exit
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Where delivered batches go
    #[arg(long, value_enum, default_value_t = Output::Log)]
    output: Output,
}

fn init_tracing(json: bool) {
    // Logs go to stderr so `--output jsonl` keeps stdout clean.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn open_watermarks(config: &Config) -> Result<WatermarkStore> {
    match (config.watermarks.restart, &config.watermarks.database) {
        (RestartPolicy::Resume, Some(path)) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory '{}'", parent.display())
                })?;
            }
            let path_str = path
                .to_str()
                .context("Watermark database path contains invalid UTF-8")?;
            let db = match Database::open(path_str).await {
                Ok(db) => db,
                Err(DatabaseError::InstanceLocked) => {
                    anyhow::bail!("{}", DatabaseError::InstanceLocked);
                }
                Err(e) => return Err(e).context("Failed to open watermark database"),
            };
            let configured: Vec<_> = config.subscriptions.iter().map(|s| s.key()).collect();
            WatermarkStore::resume_configured(db, &configured).await
        }
        _ => {
            tracing::info!("Watermarks are in memory; every key bootstraps to now");
            Ok(WatermarkStore::in_memory())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;
    config.validate()?;

    if config.subscriptions.is_empty() {
        tracing::warn!(path = %config_path.display(), "No subscriptions configured; nothing to poll");
    }

    let client = reqwest::Client::builder()
        .redirect(create_redirect_policy())
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let cancel = CancellationToken::new();

    let transport = HttpTransport::new(
        client.clone(),
        config.request_timeout(),
        config.downloader.max_resource_bytes,
    )
    .with_headers(config.resource_headers()?);
    let downloader = RetryingDownloader::new(Arc::new(transport), config.retry_policy());
    let cache_policy = config.cache_policy();
    tokio::fs::create_dir_all(&cache_policy.dir)
        .await
        .with_context(|| format!("Failed to create cache directory '{}'", cache_policy.dir.display()))?;
    let cache = ResourceCache::new(cache_policy, downloader, cancel.child_token());

    let watermarks = Arc::new(open_watermarks(&config).await?);
    let engine = Engine::new(watermarks.clone(), cache, FeedFetcher::new(config.fetch_timeout()))
        .with_concurrency(config.max_concurrent_polls);

    let sink: Arc<dyn DeliverySink> = match args.output {
        Output::Log => Arc::new(LogSink),
        Output::Jsonl => Arc::new(JsonLinesSink::new(tokio::io::stdout())),
    };

    let scheduler = Scheduler::new(
        engine,
        sink,
        config.subscriptions(&client),
        config.poll_interval(),
    );

    tracing::info!(
        kinds = ?scheduler.kinds().collect::<Vec<_>>(),
        subscriptions = config.subscriptions.len(),
        "Scheduler ready"
    );

    if args.once {
        let reports = scheduler.run_once().await;
        for (kind, report) in &reports {
            tracing::info!(
                kind = %kind,
                polled = report.polled,
                failed = report.failures.len(),
                items = report.batch.len(),
                "Cycle finished"
            );
        }
    } else {
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        });
        scheduler.run(cancel.clone()).await;
    }

    cancel.cancel();
    watermarks.flush().await;
    Ok(())
}
