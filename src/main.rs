//! leasehold - operational tool for a sharded Redis coordination setup
//!
//! ```text
//! leasehold [config.toml] route <key>...      shard owning each key, per group
//! leasehold [config.toml] ping                ping every shard once
//! leasehold [config.toml] watch [interval_s]  ping and reap pools until SIGINT/SIGTERM
//! ```
//!
//! Without a config file the shard list comes from `LEASEHOLD_*` variables.

use leasehold::config::Config;
use leasehold::metrics::Metrics;
use leasehold::registry::{Registry, spawn_reaper};
use leasehold::router::ShardRouter;
use leasehold::storage::{RedisStore, RemoteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const COMMANDS: [&str; 3] = ["route", "ping", "watch"];

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // Load configuration
    let config = if args.first().is_some_and(|a| !COMMANDS.contains(&a.as_str())) {
        let config_path = args.remove(0);
        info!("Loading configuration from {}", config_path);
        Config::from_file(&config_path)?
    } else {
        info!("Using environment configuration (set LEASEHOLD_* env vars to customize)");
        Config::from_env()?
    };

    let Some(command) = args.first().cloned() else {
        anyhow::bail!("usage: leasehold [config.toml] <route <key>...|ping|watch [interval_secs]>");
    };
    let rest = &args[1..];

    match command.as_str() {
        "route" => route(&config, rest),
        "ping" | "watch" => {
            let runtime = Builder::new_multi_thread().enable_all().build()?;
            runtime.block_on(async_main(&command, rest, &config))
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

async fn async_main(command: &str, rest: &[String], config: &Config) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::connect(config)?);
    if command == "ping" {
        let failures = ping_all(&registry, &Metrics::new()).await;
        if failures > 0 {
            anyhow::bail!("{failures} shard(s) unreachable");
        }
        return Ok(());
    }

    let interval = rest
        .first()
        .map(|s| s.parse::<u64>())
        .transpose()?
        .unwrap_or(10);
    watch(registry, Duration::from_secs(interval.max(1)), config).await
}

/// Print the owning shard of every key in every group; no connection is made
fn route(config: &Config, keys: &[String]) -> anyhow::Result<()> {
    if keys.is_empty() {
        anyhow::bail!("route needs at least one key");
    }
    for group in &config.groups {
        let router = ShardRouter::build(&group.shards, |_| Ok(()))?;
        for key in keys {
            println!("{}\t{}\t{}", group.name, key, router.route(key).id());
        }
    }
    Ok(())
}

/// Ping every shard, returning the number that failed
async fn ping_all(registry: &Registry<RedisStore>, metrics: &Metrics) -> usize {
    let mut names = Vec::new();
    registry.for_each(|name, _| names.push(name.to_string()));
    names.sort();

    let mut failures = 0;
    for name in names {
        let Some(router) = registry.get(&name) else {
            continue;
        };
        for instance in router.instances() {
            match instance.store().ping().await {
                Ok(()) => println!("{name}\t{}\tok", instance.id()),
                Err(e) => {
                    failures += 1;
                    metrics.store_errors.inc();
                    println!("{name}\t{}\t{e}", instance.id());
                }
            }
        }
    }
    failures
}

async fn watch(
    registry: Arc<Registry<RedisStore>>,
    interval: Duration,
    config: &Config,
) -> anyhow::Result<()> {
    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let metrics = Metrics::new();

    let reaper = spawn_reaper(Arc::clone(&registry), interval, cancel_token.clone());

    // Setup signal handlers
    let cancel_for_signal = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            () = terminated() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        cancel_for_signal.cancel();
    });

    info!(groups = registry.len(), ?interval, "Watching shards");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let failures = ping_all(&registry, &metrics).await;
                if failures > 0 {
                    warn!(failures, "Unreachable shards");
                }
            }
        }
    }

    if let Err(e) = reaper.await {
        error!("Reaper task failed: {}", e);
    }
    if config.metrics.enabled {
        print!("{}", metrics.gather());
    }

    info!("leasehold stopped");
    Ok(())
}

async fn terminated() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
