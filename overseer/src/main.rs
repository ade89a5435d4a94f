use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::Ebpf;

mod api;
mod attach;
mod cache;
mod codec;
mod config;
mod events;
mod flows;
mod leases;
mod metrics;

use attach::{attach_all, targets, Attach, ProbeAttacher};
use cache::NameCache;
use config::{CliArgs, Config};
use events::{EventConsumer, EventCounters};
use flows::{FlowTable, StatsMap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut bpf = Ebpf::load_file(&config.probe)
        .with_context(|| format!("failed to load probe {}", config.probe.display()))?;

    let stats = bpf.take_map("STATS").context("probe has no STATS map")?;
    let table: Arc<dyn FlowTable> = Arc::new(
        StatsMap::new(config.layout, stats)
            .with_context(|| format!("STATS map does not match the {} layout", config.layout))?,
    );

    let events = bpf.take_map("EVENTS").context("probe has no EVENTS map")?;
    let buffers = events::open_event_buffers(events, config.perf_pages)?;

    // ── Attachment ────────────────────────────────────────────────────
    let mut attacher = ProbeAttacher::new(bpf, config.pin_dir.clone());
    let report = attach_all(
        &mut attacher,
        &targets(&config.devices, config.layout, &config.directions),
    );

    // ── Tasks ─────────────────────────────────────────────────────────
    let cache = Arc::new(NameCache::new());
    let counters = Arc::new(EventCounters::default());
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Losing samples stops every consumer but leaves the exporter running.
    let consumers = token.child_token();
    for (cpu, buf) in buffers {
        let consumer = EventConsumer::new(buf, config.layout, counters.clone(), format!("cpu{cpu}"));
        tracker.spawn(consumer.run(consumers.clone()));
    }

    if config.stats_interval_seconds > 0 {
        tracker.spawn(flows::print_stats(
            table.clone(),
            config.layout,
            cache.clone(),
            Duration::from_secs(config.stats_interval_seconds),
            token.clone(),
        ));
    }

    {
        let cache = cache.clone();
        let path = config.leases.clone();
        let token = token.clone();
        tracker.spawn(async move { leases::watch_leases(&path, &cache, token).await });
    }

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        registry: metrics::registry(
            metrics::FlowCollector::new(table, config.layout, cache),
            counters.clone(),
        ),
        counters,
        layout: config.layout,
        attached: report.attached.iter().map(ToString::to_string).collect(),
        start_time: Instant::now(),
    });
    let app = api::router(app_state, &config.allowed_ips);

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            token.cancel();
            attacher.detach_all();
            return Err(e).with_context(|| format!("failed to bind {}", config.listen));
        }
    };
    tracing::info!("Server running on http://{}", config.listen);
    {
        let token = token.clone();
        tracker.spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "metrics server failed");
                token.cancel();
            }
        });
    }
    tracker.close();

    // ── Shutdown ──────────────────────────────────────────────────────
    wait_for_signal(&token).await;
    token.cancel();
    tracker.wait().await;
    attacher.detach_all();

    tracing::info!("overseer stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM arrives, or until something else cancels
/// `token`.
async fn wait_for_signal(token: &CancellationToken) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                None
            }
        };
    let sigterm = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = token.cancelled() => {}
    }
}
