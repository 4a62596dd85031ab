//! Metering collector daemon entry point.
//!
//! Wiring follows `server/src/main.rs`: load config, initialize tracing,
//! construct the shared services, spawn every worker, serve the dashboard,
//! and race OS shutdown signals against the worker set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use collector_core::blocking::BlockingPool;
use collector_core::dashboard::{self, DashboardState};
use collector_core::notify::{ChatNotifier, NotificationGate, StalenessTracker};
use collector_core::pool::ConnectionPool;
use collector_core::worker::db_to_db::DbToDbWorker;
use collector_core::worker::file_ingest::FileIngestWorker;
use collector_core::worker::foreign_to_db::ForeignToDbWorker;
use collector_core::worker::WorkerServices;
use collector_core::{ShutdownCoordinator, TaskStatusRegistry, WatermarkCache};

/// Every in-flight handle gets at most this long to finish its current
/// cycle during shutdown, mirroring `supervisor.rs`'s join timeout.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    match run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "fatal error during startup");
            std::process::exit(1);
        }
    }
}

fn init_tracing() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = std::env::var("COLLECTOR_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    std::fs::create_dir_all(&log_dir).context("creating log directory")?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "collector.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collector=info,collector_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}

async fn run() -> anyhow::Result<()> {
    let config_path =
        std::env::var("COLLECTOR_CONFIG_PATH").unwrap_or_else(|_| "./collector.toml".to_string());
    let (config, warnings) = collector_config::load_from_path(&config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;
    for warning in &warnings {
        warn!("{warning}");
    }
    info!(path = %config_path, "configuration loaded");

    let shutdown = ShutdownCoordinator::new();
    let services = WorkerServices {
        watermark: Arc::new(WatermarkCache::new()),
        destination_pool: Arc::new(ConnectionPool::new()),
        notification_gate: Arc::new(NotificationGate::new(
            config.chat.rate_limit_messages as usize,
            Duration::from_secs(config.chat.rate_limit_window_secs),
            Duration::from_secs(config.chat.rate_limit_cooldown_secs),
        )),
        staleness: Arc::new(StalenessTracker::new()),
        chat: Arc::new(ChatNotifier::new(config.chat.bot_token.clone(), config.chat.chat_id.clone())),
        status: Arc::new(TaskStatusRegistry::new()),
        shutdown: shutdown.clone(),
        blocking: Arc::new(BlockingPool::new(config.blocking_threads)?),
        notification_timeout: Duration::from_secs(config.notification_timeout_secs),
    };

    let mut handles = Vec::new();

    for job in &config.db_to_db_jobs {
        let worker = DbToDbWorker::new(
            job.clone(),
            config.destination.clone(),
            services.clone(),
            config.sync_interval_secs,
        );
        handles.push(tokio::spawn(worker.run()));
    }

    for job in &config.foreign_jobs {
        let worker = ForeignToDbWorker::new(
            job.clone(),
            config.destination.clone(),
            services.clone(),
            config.sync_interval_secs,
        );
        handles.push(tokio::spawn(worker.run()));
    }

    if let Some(ingest) = &config.file_ingest {
        let worker = FileIngestWorker::new(
            "file-ingest",
            ingest.clone(),
            config.destination.clone(),
            services.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    info!(workers = handles.len(), "sync workers spawned");

    let dashboard_pool = services
        .destination_pool
        .get_or_create(
            &collector_core::worker::destination_key(&config.destination),
            &collector_core::worker::postgres_connection_string(&config.destination),
            &collector_core::pool::PoolSettings::default(),
        )
        .await
        .context("connecting to destination database for dashboard")?;

    let dashboard_state = DashboardState {
        destination_pool: dashboard_pool,
        status: Arc::clone(&services.status),
        watermark: Arc::clone(&services.watermark),
        pool_registry: Arc::clone(&services.destination_pool),
        shutdown: shutdown.clone(),
        table_names: config.table_names.clone(),
        started_at: std::time::Instant::now(),
    };

    let app = dashboard::create_router(dashboard_state);
    let addr = SocketAddr::from((
        config.server.bind_host.parse::<std::net::IpAddr>().unwrap_or([0, 0, 0, 0].into()),
        config.server.bind_port,
    ));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding dashboard server to {addr}"))?;
    info!(%addr, "dashboard listening");

    let dashboard_shutdown = shutdown.clone();
    let dashboard_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { dashboard_shutdown.cancelled().await })
            .await
    });

    wait_for_shutdown_signal(&shutdown).await;

    info!("shutdown signal received, waiting for workers to finish their current cycle");
    for handle in handles {
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
            warn!("a worker did not finish within the shutdown timeout");
        }
    }
    let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, dashboard_handle).await;

    services.destination_pool.dispose_all().await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal(shutdown: &ShutdownCoordinator) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler, only SIGINT will trigger shutdown");
            return wait_for_ctrl_c_only(shutdown).await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    shutdown.signal();
}

async fn wait_for_ctrl_c_only(shutdown: &ShutdownCoordinator) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received SIGINT");
    shutdown.signal();
}
