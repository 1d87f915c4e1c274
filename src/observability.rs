use std::net::SocketAddr;

// ── RED metrics (message-driven) ────────────────────────────────

/// Counter: inbound messages handled. Labels: step, outcome.
pub const MESSAGES_TOTAL: &str = "chatbook_messages_total";

/// Histogram: inbound message handling latency in seconds. Labels: step.
pub const MESSAGE_DURATION_SECONDS: &str = "chatbook_message_duration_seconds";

/// Counter: bookings written. Labels: kind (created, rescheduled).
pub const BOOKINGS_COMMITTED_TOTAL: &str = "chatbook_bookings_committed_total";

/// Counter: commits that lost the race for their slot.
pub const BOOKING_CONFLICTS_TOTAL: &str = "chatbook_booking_conflicts_total";

/// Counter: messages re-run after an optimistic version conflict.
pub const CONVERSATION_SAVE_RETRIES_TOTAL: &str = "chatbook_conversation_save_retries_total";

/// Histogram: free-slot computation latency in seconds. Labels: policy.
pub const AVAILABILITY_DURATION_SECONDS: &str = "chatbook_availability_duration_seconds";

/// Counter: outbound messages published.
pub const OUTBOUND_MESSAGES_TOTAL: &str = "chatbook_outbound_messages_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chatbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chatbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chatbook_connections_rejected_total";

/// Gauge: number of open business stores.
pub const TENANTS_ACTIVE: &str = "chatbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chatbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chatbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}
