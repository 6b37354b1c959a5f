use anyhow::{Context, Result};
use clap::Parser;
use futures::FutureExt;
use prometheus::Registry;
use shiroxy::analytics::Analytics;
use shiroxy::config::Config;
use shiroxy::domains::{AcmeIssuer, DomainManager, DomainStore};
use shiroxy::persistence;
use shiroxy::proxy::balancer::LoadBalancer;
use shiroxy::proxy::buffer_pool::BufferPool;
use shiroxy::proxy::forwarder::Forwarder;
use shiroxy::proxy::health_checker::HealthChecker;
use shiroxy::proxy::listener::Frontend;
use shiroxy::webhook::WebhookDispatcher;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "shiroxy", about = "HTTP/HTTPS reverse proxy with per-domain ACME TLS")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "shiroxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shiroxy=info".into()),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let config = Config::load(&args.config).context("loading configuration")?;
    let env_name = config.environment.name.as_str().to_string();
    let persistence_dir = config.default.data_persistance_path.clone();

    info!(
        environment = %env_name,
        binds = config.frontend.bind.len(),
        servers = config.backend.servers.len(),
        "Starting shiroxy"
    );

    // Unreachable storage is fatal at startup.
    let store = Arc::new(
        DomainStore::connect(&config.default.storage)
            .await
            .context("connecting domain storage")?,
    );

    let restored = match persistence::load_snapshot(&persistence_dir, &env_name, &store).await {
        Ok(restored) => restored,
        Err(e) => {
            warn!(error = %e, "Failed to restore snapshot, starting fresh");
            None
        }
    };
    let restored_secret = restored.map(|r| r.webhook_secret);

    let webhooks = Arc::new(WebhookDispatcher::start(
        config.webhook.clone(),
        restored_secret,
    ));

    let registry = Registry::new();
    let balancer = Arc::new(LoadBalancer::from_config(&config).context("building balancer")?);
    let buffer_pool = Arc::new(BufferPool::default());
    let forwarder = Arc::new(Forwarder::new(&registry, Arc::clone(&buffer_pool)));
    let analytics = Arc::new(Analytics::new(Arc::clone(&store), forwarder.stats()));

    let issuer = AcmeIssuer::from_config(&config);
    let domains = Arc::new(DomainManager::new(
        Arc::clone(&store),
        issuer,
        Arc::clone(&webhooks),
    ));
    info!(
        domains = domains.list().len(),
        "Domain inventory ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let checker = HealthChecker::start(
        Arc::clone(&balancer),
        Arc::clone(&webhooks),
        Duration::from_secs(config.backend.health_check_trigger_duration),
        &registry,
        shutdown_rx.clone(),
    );

    let frontend = Arc::new(Frontend::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&balancer),
        Arc::clone(&forwarder),
        registry.clone(),
    ));
    let _bind_handles = frontend
        .spawn_binds(shutdown_rx.clone())
        .await
        .context("starting frontends")?;

    // Serve until a shutdown signal lands; a panic escaping the serving
    // path is treated the same way so the snapshot is still written.
    let outcome = AssertUnwindSafe(wait_for_shutdown()).catch_unwind().await;
    match &outcome {
        Ok(signal) => info!(signal = %signal, "Signal received, shutting down"),
        Err(_) => error!("Panic reached the top level, attempting snapshot"),
    }

    let _ = shutdown_tx.send(true);
    checker.stop().await;

    let snapshot = analytics.snapshot();
    match persistence::write_snapshot(
        &persistence_dir,
        &env_name,
        &store,
        snapshot,
        webhooks.secret(),
    )
    .await
    {
        Ok(()) => info!("Exiting gracefully | Success 😇"),
        Err(e) => error!(error = %e, "Exiting gracefully | Failed 😞"),
    }

    Ok(())
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn wait_for_shutdown() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting on SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
