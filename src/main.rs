use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use staylock::catalog::{Catalog, InMemoryCatalog};
use staylock::config::Config;
use staylock::engine::Engine;
use staylock::notify::NotifyHub;
use staylock::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use staylock::{sweeper, wire};

/// How often the compactor checks the WAL append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    staylock::observability::init(config.metrics_port);

    let tls_acceptor = staylock::tls::load_tls_acceptor(config.tls.as_ref())?;

    let catalog = match &config.catalog {
        Some(path) => {
            let catalog = InMemoryCatalog::load_json(path)?;
            info!(rooms = catalog.len(), "catalog loaded from {}", path.display());
            catalog
        }
        None => {
            warn!("STAYLOCK_CATALOG not set, starting with an empty room catalog");
            InMemoryCatalog::new()
        }
    };
    let catalog: Arc<dyn Catalog> = Arc::new(catalog);

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(
        Engine::new(config.wal_path(), catalog, Arc::new(NotifyHub::new()))?
            .with_lock_policy(config.lock_policy()),
    );

    tokio::spawn(sweeper::run_completion_sweeper(engine.clone(), config.sweep_interval));
    tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("staylock listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  lock_timeout: {:?}, max_retries: {}", config.lock_timeout, config.max_retries);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // Leave a compact log behind so the next start replays quickly.
    if let Err(e) = engine.compact_wal().await {
        warn!("final WAL compaction failed: {e}");
    }
    info!(
        bookings = engine.booking_count(),
        payments = engine.payment_count(),
        "staylock stopped"
    );
    Ok(())
}
