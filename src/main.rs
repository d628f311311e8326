// src/main.rs

use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use outpost_scanner::bus::{result_bus, NotificationHub, ProcessedBus};
use outpost_scanner::config::Config;
use outpost_scanner::coordinator::{IpLeasePool, LeaseCoordinator};
use outpost_scanner::core::guidance::ruleset::RULESET_V1;
use outpost_scanner::gateway::{self, run_queue_worker, AppState};
use outpost_scanner::kv::{KvStore, MemoryKvStore, RedisKvStore};
use outpost_scanner::logging;
use outpost_scanner::processor::ResultProcessor;
use outpost_scanner::store::{MemoryRepository, ResultRepository};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    logging::initialize_logging()?;

    let config = Config::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        scanners = config.scanner_base_urls.len(),
        redis = config.redis_url.is_some(),
        test_mode = config.test_mode,
        "starting outpost scanner"
    );

    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKvStore::connect(url).await?),
        None => Arc::new(MemoryKvStore::new()),
    };
    let leases = Arc::new(IpLeasePool::new(kv.clone(), config.max_probes_per_ip));
    let repository: Arc<dyn ResultRepository> = Arc::new(MemoryRepository::new());
    let notifications = Arc::new(NotificationHub::new());
    let processed = ProcessedBus::new();
    let (bus, events) = result_bus(config.queue_capacity);

    let shutdown = CancellationToken::new();
    let (state, queues) = AppState::new(
        config.clone(),
        repository.clone(),
        bus,
        leases,
        notifications.clone(),
    )?;

    let mut workers = JoinSet::new();
    workers.spawn(
        ResultProcessor::new(repository, notifications, processed, &RULESET_V1)
            .run(events, shutdown.clone()),
    );
    workers.spawn(run_queue_worker(
        "mail",
        queues.mail,
        state.dispatcher(),
        shutdown.clone(),
    ));
    workers.spawn(run_queue_worker(
        "web",
        queues.web,
        state.dispatcher(),
        shutdown.clone(),
    ));
    workers.spawn(LeaseCoordinator::new(kv).run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, gateway::router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The serve future only returns once the signal fired; make sure the
    // background workers see it too, then drain them.
    shutdown.cancel();
    while workers.join_next().await.is_some() {}
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
