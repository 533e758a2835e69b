use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staylock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staylock_query_duration_seconds";

/// Counter: coordinator operations retried after a lock timeout or stale read. Labels: operation.
pub const TXN_RETRIES_TOTAL: &str = "staylock_txn_retries_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: committed booking status changes. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "staylock_booking_transitions_total";

/// Counter: committed payment status changes. Labels: status.
pub const PAYMENT_TRANSITIONS_TOTAL: &str = "staylock_payment_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staylock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staylock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staylock_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "staylock_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staylock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staylock_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertPayment { .. } => "insert_payment",
        Command::LinkPayment { .. } => "link_payment",
        Command::SettlePayment { .. } => "settle_payment",
        Command::RefundPayment { .. } => "refund_payment",
        Command::DeletePayment { .. } => "delete_payment",
        Command::SelectPayments { .. } => "select_payments",
        Command::SelectAvailableRooms { .. } => "select_available_rooms",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
