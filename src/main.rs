use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use chatbook::config::ServerConfig;
use chatbook::conversation::Dispatcher;
use chatbook::directory::InMemoryDirectory;
use chatbook::engine::AvailabilityEngine;
use chatbook::outbox::OutboxHub;
use chatbook::tenant::TenantManager;
use chatbook::time::SystemClock;
use chatbook::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    chatbook::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;

    let directory = Arc::new(InMemoryDirectory::load_json(&config.businesses)?);
    if directory.is_empty() {
        tracing::warn!(
            "no businesses in {}, every inbound message will be rejected",
            config.businesses.display()
        );
    }
    let tenants = Arc::new(TenantManager::new(
        config.data_dir.clone(),
        config.compact_threshold,
    ));
    let hub = Arc::new(OutboxHub::new());
    let dispatcher = Arc::new(Dispatcher::new(
        directory.clone(),
        tenants.clone(),
        tenants,
        hub.clone(),
        Arc::new(SystemClock),
    )
    .with_availability(AvailabilityEngine::new(config.smart_scan)));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("chatbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  businesses: {} from {}", directory.len(), config.businesses.display());
    info!("  max_connections: {}", config.max_connections);
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
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
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

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(chatbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(chatbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(chatbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let dispatcher = dispatcher.clone();
                let hub = hub.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, dispatcher, hub).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(chatbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("chatbook stopped");
    Ok(())
}
