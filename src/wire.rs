use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::access::{self, Viewer};
use crate::auth::LabresAuthSource;
use crate::engine::{Engine, EngineError, Rejection};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter};

pub struct LabresHandler {
    engine: Arc<Engine>,
    service_user: String,
    query_parser: Arc<LabresQueryParser>,
}

impl LabresHandler {
    pub fn new(engine: Arc<Engine>, service_user: String) -> Self {
        Self {
            engine,
            service_user,
            query_parser: Arc::new(LabresQueryParser),
        }
    }

    fn resolve_viewer<C: ClientInfo>(&self, client: &C) -> PgWireResult<Viewer> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        access::resolve(&self.engine, &login, &self.service_user).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("refused query from login {login:?}: {e}");
            engine_err(e)
        })
    }

    /// Authorize, execute and record metrics for one parsed command.
    async fn run(&self, viewer: Viewer, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = match viewer.authorize(&cmd) {
            Ok(()) => self.execute_command(viewer, cmd).await,
            Err(e) => Err(e),
        };
        let status = match &result {
            Ok(_) => "ok",
            Err(EngineError::Rejected(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(
        &self,
        viewer: Viewer,
        cmd: Command,
    ) -> Result<Vec<Response>, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertUser {
                id,
                username,
                email,
                role,
            } => {
                engine.register_user(id, username, email, role).await?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::UpdateUserRole { id, role } => {
                engine.set_user_role(id, role).await?;
                Ok(vec![execution("UPDATE", 1)])
            }
            Command::DeleteUser { id } => {
                engine.delete_user(id).await?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::InsertEquipment {
                id,
                name,
                description,
                is_available,
            } => {
                engine
                    .create_equipment(id, name, description, is_available)
                    .await?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::UpdateEquipment { ids, patch } => {
                let n = engine.update_equipment(ids, patch).await?;
                Ok(vec![execution("UPDATE", n)])
            }
            Command::DeleteEquipment { id } => {
                engine.delete_equipment(id).await?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::InsertAdditionalEquipment { id, name } => {
                engine.create_additional_equipment(id, name).await?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteAdditionalEquipment { id } => {
                engine.delete_additional_equipment(id).await?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::InsertReservation(new) => {
                engine.create_reservation(new).await?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::BatchInsertReservations(batch) => {
                let n = engine.batch_create_reservations(batch).await?;
                Ok(vec![execution("INSERT", n)])
            }
            Command::UpdateReservation { id, patch } => {
                let existing = engine.get_reservation(id).await?;
                viewer.require_owner_or_admin(existing.user_id)?;
                engine.update_reservation(id, patch).await?;
                Ok(vec![execution("UPDATE", 1)])
            }
            Command::MarkNotified { ids } => {
                let n = engine.mark_notified(ids).await?;
                Ok(vec![execution("UPDATE", n)])
            }
            Command::DeleteReservation { id } => {
                let existing = engine.get_reservation(id).await?;
                viewer.require_owner_or_admin(existing.user_id)?;
                engine.delete_reservation(id).await?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectEquipment { id, is_available } => {
                let mut items = match id {
                    Some(id) => or_empty(engine.get_equipment(id).await.map(|e| vec![e]))?,
                    None => engine.list_equipment().await,
                };
                items.retain(|e| is_available.is_none_or(|a| e.is_available == a));
                let schema = Arc::new(equipment_schema());
                let rows = items.iter().map(|e| encode_equipment(&schema, e)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectUsers { id } => {
                let users: Vec<User> = engine
                    .list_users()
                    .into_iter()
                    .filter(|u| id.is_none_or(|id| u.id == id) && viewer.can_see_user(u))
                    .collect();
                let schema = Arc::new(users_schema());
                let rows = users.iter().map(|u| encode_user(&schema, u)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAdditionalEquipment => {
                let schema = Arc::new(additional_equipment_schema());
                let rows = engine
                    .list_additional_equipment()
                    .iter()
                    .map(|a| encode_additional(&schema, a))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectReservations(filter) => {
                let filter = viewer.scope_filter(filter);
                let reservations = self.select_reservations(&filter).await?;
                let schema = Arc::new(reservations_schema());
                let rows = reservations
                    .iter()
                    .filter(|r| viewer.can_see_reservation(r))
                    .map(|r| encode_reservation(&schema, r))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }

    /// Pick the narrowest engine query for the filter, then apply the rest.
    async fn select_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        let engine = &self.engine;
        let mut found = if let Some(id) = filter.id {
            or_empty(engine.get_reservation(id).await.map(|r| vec![r]))?
        } else if let Some(eid) = filter.equipment_id {
            match filter.window {
                Some((start, end)) => {
                    or_empty(engine.find_overlapping(eid, start, end, None).await)?
                }
                None => or_empty(engine.reservations_for_equipment(eid).await)?,
            }
        } else if let Some(uid) = filter.user_id {
            engine.reservations_for_user(uid).await
        } else {
            engine.all_reservations().await
        };
        found.retain(|r| {
            filter.equipment_id.is_none_or(|eid| r.equipment_id == eid)
                && filter.user_id.is_none_or(|uid| r.user_id == uid)
                && filter.notified.is_none_or(|n| r.notified == n)
        });
        Ok(found)
    }
}

/// A SELECT naming a missing row yields no rows, not an error.
fn or_empty<T>(result: Result<Vec<T>, EngineError>) -> Result<Vec<T>, EngineError> {
    match result {
        Err(EngineError::NotFound(_)) => Ok(Vec::new()),
        other => other,
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn equipment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("is_available", Type::BOOL),
    ]
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("username", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("role", Type::VARCHAR),
    ]
}

fn additional_equipment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("equipment_id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("test_name", Type::VARCHAR),
        text_field("temperature", Type::FLOAT8),
        text_field("start_time", Type::INT8),
        text_field("end_time", Type::INT8),
        text_field("additional_equipment", Type::VARCHAR),
        text_field("notified", Type::BOOL),
    ]
}

fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql) {
        Some("equipment") => equipment_schema(),
        Some("users") => users_schema(),
        Some("additional_equipment") => additional_equipment_schema(),
        Some("reservations") => reservations_schema(),
        _ => vec![],
    }
}

fn encode_equipment(schema: &Arc<Vec<FieldInfo>>, e: &EquipmentInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&e.id.to_string())?;
    encoder.encode_field(&e.name)?;
    encoder.encode_field(&e.description)?;
    encoder.encode_field(&e.is_available)?;
    Ok(encoder.take_row())
}

fn encode_user(schema: &Arc<Vec<FieldInfo>>, u: &User) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&u.id.to_string())?;
    encoder.encode_field(&u.username)?;
    encoder.encode_field(&u.email)?;
    encoder.encode_field(&u.role.as_str().to_string())?;
    Ok(encoder.take_row())
}

fn encode_additional(
    schema: &Arc<Vec<FieldInfo>>,
    a: &AdditionalEquipment,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.name)?;
    Ok(encoder.take_row())
}

fn encode_reservation(schema: &Arc<Vec<FieldInfo>>, r: &Reservation) -> PgWireResult<DataRow> {
    let extras = r
        .additional_equipment
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.equipment_id.to_string())?;
    encoder.encode_field(&r.user_id.to_string())?;
    encoder.encode_field(&r.test_name)?;
    encoder.encode_field(&r.temperature)?;
    encoder.encode_field(&r.span.start)?;
    encoder.encode_field(&r.span.end)?;
    encoder.encode_field(&extras)?;
    encoder.encode_field(&r.notified)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for LabresHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let viewer = self.resolve_viewer(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(viewer, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LabresQueryParser;

#[async_trait]
impl QueryParser for LabresQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LabresHandler {
    type Statement = String;
    type QueryParser = LabresQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let viewer = self.resolve_viewer(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(viewer, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, with their
/// byte ranges in `sql`.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound text-format values into the statement in one pass, so a
/// value that itself contains `$N` is never rewritten.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LabresFactory {
    handler: Arc<LabresHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LabresAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LabresFactory {
    pub fn new(engine: Arc<Engine>, password: String, service_user: String) -> Self {
        Self {
            handler: Arc::new(LabresHandler::new(engine, service_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LabresAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LabresFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    service_user: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = LabresFactory::new(engine, password, service_user);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(Rejection::TimeConflict) => "23P01",
        EngineError::Rejected(Rejection::InvalidTimeRange) => "22023",
        EngineError::NotFound(_) => "02000",
        EngineError::Forbidden(_) => "42501",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM equipment"), 0);
        assert_eq!(
            count_params("INSERT INTO reservations VALUES ($1, $2, $3, $4, $5, $6, $7, $10)"),
            10
        );
        assert_eq!(count_params("SELECT * FROM users WHERE username = '$9'"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO additional_equipment VALUES ($1, $2)";
        let params = vec![
            Some("01J0000000000000000000000A".to_string()),
            Some("cost $1 run".to_string()),
        ];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO additional_equipment VALUES ('01J0000000000000000000000A', 'cost $1 run')"
        );
    }

    #[test]
    fn bind_params_quotes_and_skips_literals() {
        let params = vec![Some("it's".to_string()), None];
        assert_eq!(
            bind_params("SELECT '$1', $1, $2, $3", &params),
            "SELECT '$1', 'it''s', NULL, $3"
        );

        let mut many: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        many[0] = Some("$10".into());
        assert_eq!(bind_params("$1 $10", &many), "'$10' '10'");
    }

    #[test]
    fn rejections_map_to_distinct_sqlstates() {
        assert_eq!(sqlstate(&Rejection::TimeConflict.into()), "23P01");
        assert_eq!(sqlstate(&Rejection::InvalidTimeRange.into()), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::new())), "02000");
        assert_eq!(sqlstate(&EngineError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(Ulid::new())), "P0001");
    }

    #[test]
    fn rejection_message_reaches_client() {
        let e: EngineError = Rejection::InvalidTimeRange.into();
        assert_eq!(e.to_string(), "end time must be after start time");
        assert!(matches!(engine_err(e), PgWireError::UserError(_)));
    }

    #[test]
    fn or_empty_swallows_only_not_found() {
        let missing: Result<Vec<u8>, _> = Err(EngineError::NotFound(Ulid::new()));
        assert!(or_empty(missing).unwrap().is_empty());
        let forbidden: Result<Vec<u8>, _> = Err(EngineError::Forbidden("x"));
        assert!(or_empty(forbidden).is_err());
    }

    #[test]
    fn statement_schemas() {
        assert_eq!(schema_for_statement("SELECT * FROM reservations").len(), 9);
        assert_eq!(schema_for_statement("SELECT * FROM users").len(), 4);
        assert!(schema_for_statement("DELETE FROM users WHERE id = '1'").is_empty());
    }
}
