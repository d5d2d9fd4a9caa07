use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "availd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "availd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "availd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "availd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "availd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "availd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "availd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "availd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "availd_wal_flush_batch_size";

// ── Availability decisions ──────────────────────────────────────

/// Counter: availability evaluations. Labels: outcome (accept, reject, error).
pub const EVALUATIONS_TOTAL: &str = "availd_evaluations_total";

/// Counter: packing-list saves refused for lack of stock.
pub const PACKING_LIST_REJECTIONS_TOTAL: &str = "availd_packing_list_rejections_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEquipment { .. } => "insert_equipment",
        Command::UpdateEquipment { .. } => "update_equipment",
        Command::DeleteEquipment { .. } => "delete_equipment",
        Command::InsertReservations { .. } => "insert_reservations",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::DeleteEventReservations { .. } => "delete_event_reservations",
        Command::SavePackingList { .. } => "save_packing_list",
        Command::SelectEquipment => "select_equipment",
        Command::SelectReservations { .. } => "select_reservations",
        Command::CheckBookedQuantity { .. } => "check_booked_quantity",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
