use std::fmt::Debug;
use std::io;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::AccessCodeAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct StaybookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StaybookQueryParser>,
}

impl StaybookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StaybookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one statement against a tenant engine, recording RED metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = execute_command(&engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        result.map_err(engine_err)
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
    match cmd {
        Command::InsertProperty { id, name, max_guests } => {
            engine.create_property(id, name, max_guests).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateProperty { id, patch } => {
            engine.update_property(id, patch).await?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::DeleteProperty { id } => {
            engine.delete_property(id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectProperties => {
            let props = engine.list_properties().await;
            let schema = Arc::new(properties_schema());
            let rows: Vec<PgWireResult<_>> = props
                .into_iter()
                .map(|p| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&p.id.to_string())?;
                    encoder.encode_field(&p.name)?;
                    encoder.encode_field(&p.max_guests.map(i64::from))?;
                    encoder.encode_field(&(p.active_reservations as i64))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::InsertReservation { new, status } => {
            engine.create_reservation(new, status).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::ConfirmReservation { id } => {
            engine.confirm_reservation(id).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::CancelReservation { id } => {
            engine.cancel_reservation(id).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteReservation { id } => {
            engine.delete_reservation(id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectReservations { property_id, status } => {
            let reservations = engine.list_reservations(property_id, status).await;
            let schema = Arc::new(reservations_schema());
            let rows: Vec<PgWireResult<_>> = reservations
                .into_iter()
                .map(|r| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.property_id.to_string())?;
                    encoder.encode_field(&r.stay.check_in.to_string())?;
                    encoder.encode_field(&r.stay.check_out.to_string())?;
                    encoder.encode_field(&r.status.as_str())?;
                    encoder.encode_field(&i64::from(r.guest_count))?;
                    encoder.encode_field(&r.email)?;
                    encoder.encode_field(&r.total_price)?;
                    encoder.encode_field(&r.special_requests)?;
                    encoder.encode_field(&r.created_at)?;
                    encoder.encode_field(&r.confirmed_at)?;
                    encoder.encode_field(&r.cancelled_at)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectConflicts {
            property_id,
            check_in,
            check_out,
        } => {
            let conflicts = engine.check_conflicts(property_id, check_in, check_out).await?;
            let schema = Arc::new(conflicts_schema());
            let rows: Vec<PgWireResult<_>> = conflicts
                .into_iter()
                .map(|c| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&c.reservation_id.to_string())?;
                    encoder.encode_field(&c.check_in.to_string())?;
                    encoder.encode_field(&c.check_out.to_string())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectCalendar {
            property_id,
            year,
            month,
        } => {
            let days = engine.month_calendar(property_id, year, month).await?;
            let schema = Arc::new(calendar_schema());
            let rows: Vec<PgWireResult<_>> = days
                .into_iter()
                .map(|(date, day)| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&date)?;
                    encoder.encode_field(&i64::from(day.check_in_count))?;
                    encoder.encode_field(&i64::from(day.check_out_count))?;
                    encoder.encode_field(&i64::from(day.staying_count))?;
                    encoder.encode_field(&i64::from(day.requested_count))?;
                    encoder.encode_field(&day.has_confirmed)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectAvailability {
            property_id,
            start,
            end,
            min_nights,
        } => {
            let open = engine.open_ranges(property_id, start, end, min_nights).await?;
            let schema = Arc::new(availability_schema());
            let pid = property_id.to_string();
            let rows: Vec<PgWireResult<_>> = open
                .into_iter()
                .map(|range| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&pid)?;
                    encoder.encode_field(&range.check_in.to_string())?;
                    encoder.encode_field(&range.check_out.to_string())?;
                    encoder.encode_field(&range.nights())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn properties_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("max_guests", Type::INT8),
        field("active_reservations", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("property_id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("guest_count", Type::INT8),
        field("email", Type::VARCHAR),
        field("total_price", Type::INT8),
        field("special_requests", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("confirmed_at", Type::INT8),
        field("cancelled_at", Type::INT8),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("reservation_id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("check_in_count", Type::INT8),
        field("check_out_count", Type::INT8),
        field("staying_count", Type::INT8),
        field("requested_count", Type::INT8),
        field("has_confirmed", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("property_id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("nights", Type::INT8),
    ]
}

/// Row shape of a statement, decided from the table after `FROM` without a
/// full parse so it also works on statements with `$n` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    let Some(from) = upper.find(" FROM ") else {
        return vec![];
    };
    let table: String = upper[from + 6..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    match table.as_str() {
        "PROPERTIES" => properties_schema(),
        "RESERVATIONS" => reservations_schema(),
        "CONFLICTS" => conflicts_schema(),
        "CALENDAR" => calendar_schema(),
        "AVAILABILITY" => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaybookHandler {
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
        Ok(vec![self.run(&*client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaybookQueryParser;

#[async_trait]
impl QueryParser for StaybookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaybookHandler {
    type Statement = String;
    type QueryParser = StaybookQueryParser;

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
        self.run(&*client, &sql).await
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
            result_schema(&target.statement),
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
        )))
    }
}

/// `$N` placeholders outside single-quoted literals, as
/// `(byte start, byte end, N)`.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // `''` inside a literal closes and reopens it, which nets out.
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i > start + 1
                    && let Ok(n) = sql[start + 1..i].parse::<usize>()
                {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute_text_params(&portal.statement.statement, &portal.parameters)
}

/// Single pass over the statement text: substituted values are never scanned
/// again, so a `$N` inside a value stays literal text.
fn substitute_text_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaybookFactory {
    handler: Arc<StaybookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AccessCodeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StaybookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, access_code: String) -> Self {
        let auth_source = AccessCodeAuthSource::new(access_code);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaybookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaybookFactory {
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
    access_code: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(StaybookFactory::new(tenant_manager, access_code));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for each engine error. Conflicts use `exclusion_violation`,
/// the code Postgres raises for overlapping ranges.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidDates { .. } => "22007",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::GuestCountExceeded { .. } => "23514",
        EngineError::HasActiveReservations(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

/// The message carries the JSON error body, conflicts included.
fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_json().to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
