use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "labres_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "labres_query_duration_seconds";

/// Counter: reservation candidates the validator turned away. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "labres_reservations_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labres_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labres_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labres_connections_rejected_total";

/// Counter: queries refused because the login maps to no known user.
pub const AUTH_FAILURES_TOTAL: &str = "labres_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labres_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labres_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "labres_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUserRole { .. } => "update_user_role",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertEquipment { .. } => "insert_equipment",
        Command::UpdateEquipment { .. } => "update_equipment",
        Command::DeleteEquipment { .. } => "delete_equipment",
        Command::InsertAdditionalEquipment { .. } => "insert_additional_equipment",
        Command::DeleteAdditionalEquipment { .. } => "delete_additional_equipment",
        Command::InsertReservation(_) => "insert_reservation",
        Command::BatchInsertReservations(_) => "batch_insert_reservations",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::MarkNotified { .. } => "mark_notified",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectEquipment { .. } => "select_equipment",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectAdditionalEquipment => "select_additional_equipment",
        Command::SelectReservations(_) => "select_reservations",
    }
}
