use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::evaluator::{self, Decision};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ReservationFilter, SqlError};
use crate::tenant::TenantManager;

pub struct AvaildHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AvaildQueryParser>,
}

impl AvaildHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AvaildQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, run and time one statement. `format` is the result column format
    /// the client asked for.
    async fn run_sql<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!(command = label, "executing statement");

        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertEquipment {
                id,
                name,
                track_type,
                total_quantity,
            } => {
                engine
                    .create_resource(id, name, track_type, total_quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateEquipment { id, patch } => {
                engine.update_resource(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteEquipment { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservations { rows } => {
                let count = engine.insert_reservations(rows).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteEventReservations { event_id } => {
                let count = engine
                    .delete_reservations_for_event(event_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(count)))
            }
            Command::SavePackingList {
                event_id,
                start,
                end,
                lines,
            } => {
                let ids = engine
                    .save_packing_list(event_id, start, end, &lines)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(ids.len())))
            }
            Command::SelectEquipment => {
                let schema = Arc::new(equipment_schema(format));
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources()
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.track_type.as_str().to_string())?;
                        encoder.encode_field(&i64::from(r.total_quantity))?;
                        encoder.encode_field(&i64::from(r.current_available))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::Equipment(id) => engine.get_reservations(id).await,
                    ReservationFilter::Event(id) => engine.get_event_reservations(id).await,
                };
                let schema = Arc::new(event_equipment_schema(format));
                let rows: Vec<PgWireResult<_>> = reservations
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.event_id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&i64::from(r.quantity))?;
                        encoder.encode_field(&r.start.to_string())?;
                        encoder.encode_field(&r.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::CheckBookedQuantity {
                equipment_id,
                start,
                end,
                exclude_event_id,
            } => {
                let window = DateWindow::try_new(start, end).ok_or_else(|| {
                    user_error(
                        "22023",
                        format!("start_date {start} is after end_date {end}"),
                    )
                })?;
                let booked = engine
                    .booked_quantity(equipment_id, window, exclude_event_id.map(Exclusion::Event))
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(booked_quantity_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&i64::try_from(booked).unwrap_or(i64::MAX))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability {
                equipment_id,
                start,
                end,
                quantity,
                exclude,
            } => {
                let (resource, decision) =
                    evaluator::check_loaded(engine, equipment_id, quantity, start, end, exclude)
                        .await
                        .map_err(|e| engine_err(e.into()))?;
                let current_available = i64::from(resource.current_available);

                let schema = Arc::new(availability_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&equipment_id.to_string())?;
                encoder.encode_field(&start.to_string())?;
                encoder.encode_field(&end.to_string())?;
                encoder.encode_field(&quantity)?;
                encoder.encode_field(&i64::try_from(decision.booked()).unwrap_or(i64::MAX))?;
                encoder.encode_field(&current_available)?;
                encoder.encode_field(&i64::from(decision.actual_available()))?;
                encoder.encode_field(&decision.is_accept())?;
                let message = match decision {
                    Decision::Accept { .. } => None,
                    Decision::Reject(shortfall) => Some(shortfall.to_string()),
                };
                encoder.encode_field(&message)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn equipment_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("track_type", Type::VARCHAR),
            ("total_quantity", Type::INT8),
            ("current_available", Type::INT8),
        ],
        format,
    )
}

/// Dates go out as `'YYYY-MM-DD'` text.
fn event_equipment_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("event_id", Type::VARCHAR),
            ("equipment_id", Type::VARCHAR),
            ("quantity", Type::INT8),
            ("start_date", Type::VARCHAR),
            ("end_date", Type::VARCHAR),
        ],
        format,
    )
}

fn booked_quantity_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("check_equipment_booked_quantity", Type::INT8)], format)
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("equipment_id", Type::VARCHAR),
            ("start_date", Type::VARCHAR),
            ("end_date", Type::VARCHAR),
            ("requested", Type::INT8),
            ("booked", Type::INT8),
            ("current_available", Type::INT8),
            ("actual_available", Type::INT8),
            ("available", Type::BOOL),
            ("message", Type::VARCHAR),
        ],
        format,
    )
}

/// Row description for a statement, decided before its parameters are bound.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("CHECK_EQUIPMENT_BOOKED_QUANTITY") {
        booked_quantity_schema(format)
    } else if upper.contains("AVAILABILITY") {
        availability_schema(format)
    } else if upper.contains("EVENT_EQUIPMENT") {
        event_equipment_schema(format)
    } else if upper.contains("EQUIPMENT") {
        equipment_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for AvaildHandler {
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
        Ok(vec![self.run_sql(client, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AvaildQueryParser;

#[async_trait]
impl QueryParser for AvaildQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AvaildHandler {
    type Statement = String;
    type QueryParser = AvaildQueryParser;

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
        let sql = substitute_params(portal);
        self.run_sql(client, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N) in source order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote inside a literal closes and reopens it, which
            // leaves the state unchanged.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j > i + 1
                    && let Ok(n) = sql[i + 1..j].parse::<usize>()
                {
                    found.push((i..j, n));
                    i = j;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_text_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: each placeholder is replaced once and bound values
/// are never rescanned. Placeholders without a bound value stay as written.
fn bind_text_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        last = range.end;
    }
    result.push_str(&sql[last..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// `AVAILD_PASSWORD`, checked in cleartext for every user. The tenant comes
/// from the database name, not the user, so one password covers all tenants.
#[derive(Debug)]
pub struct ServerPassword(String);

#[async_trait]
impl AuthSource for ServerPassword {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = login.user(), database = login.database(), "password login");
        Ok(Password::new(None, self.0.as_bytes().to_vec()))
    }
}


pub struct AvaildFactory {
    handler: Arc<AvaildHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ServerPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AvaildFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ServerPassword(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AvaildHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AvaildFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(AvaildFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::Insufficient(_) => "23P01",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_invalid_input() { "22023" } else { "42601" };
    user_error(code, e.to_string())
}
