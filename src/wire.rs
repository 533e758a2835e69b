use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::StaylockAuthSource;
use crate::engine::{Engine, EngineError, NewBooking, NewPayment};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct StaylockHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StaylockQueryParser>,
}

impl StaylockHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StaylockQueryParser),
        }
    }

    /// The caller, from the `<role>:<user ulid>` login name. The startup
    /// handler already refused malformed names.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        user.parse::<Actor>()
            .map_err(|_| engine_err(EngineError::InvalidActor(user)))
    }

    /// Parse and run one statement, recording RED metrics.
    async fn run(&self, actor: Actor, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(command = label, actor = %actor, "query failed: {e}");
        }
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBooking {
                id,
                room_id,
                stay,
                total_price,
            } => {
                let req = NewBooking {
                    id,
                    room_id,
                    stay,
                    total_price,
                };
                engine.create_booking(actor, req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RescheduleBooking { id, room_id, stay } => {
                engine
                    .reschedule_booking(actor, id, room_id, stay)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id, filter } => {
                let bookings = match id {
                    Some(id) => vec![engine.get_booking(actor, id).await.map_err(engine_err)?],
                    None => engine.list_bookings(actor, &filter).await,
                };
                rows(booking_schema(), bookings, encode_booking)
            }
            Command::InsertPayment {
                id,
                amount,
                method,
                booking_id,
            } => {
                let req = NewPayment {
                    id,
                    amount,
                    method,
                    booking_id,
                };
                engine.create_payment(actor, req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::LinkPayment { id, booking_id } => {
                engine
                    .link_payment(actor, id, booking_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SettlePayment {
                id,
                outcome,
                transaction_id,
            } => {
                engine
                    .settle_payment(actor, id, outcome, transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RefundPayment { id } => {
                engine.refund_payment(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeletePayment { id } => {
                engine.delete_payment(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectPayments { id, filter } => {
                let payments = match id {
                    Some(id) => vec![engine.get_payment(actor, id).await.map_err(engine_err)?],
                    None => engine.list_payments(actor, &filter).await,
                };
                rows(payment_schema(), payments, encode_payment)
            }
            Command::SelectAvailableRooms { query } => {
                let rooms = engine
                    .query_available_rooms(&query)
                    .await
                    .map_err(engine_err)?;
                rows(room_schema(), rooms, encode_room)
            }
            Command::SelectAvailability {
                room_id,
                stay,
                exclude,
            } => {
                let available = engine
                    .is_available(room_id, stay, exclude)
                    .await
                    .map_err(engine_err)?;
                rows(availability_schema(), [(room_id, stay, available)], encode_availability)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("room_id", Type::VARCHAR),
        text_field("check_in", Type::VARCHAR),
        text_field("check_out", Type::VARCHAR),
        text_field("total_price", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("payment_id", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("booking_id", Type::VARCHAR),
        text_field("amount", Type::VARCHAR),
        text_field("method", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("transaction_id", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("hotel_id", Type::VARCHAR),
        text_field("number", Type::INT8),
        text_field("price_per_night", Type::VARCHAR),
        text_field("capacity", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id", Type::VARCHAR),
        text_field("check_in", Type::VARCHAR),
        text_field("check_out", Type::VARCHAR),
        text_field("available", Type::BOOL),
    ]
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_booking(enc: &mut DataRowEncoder, b: Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&b.room_id.to_string())?;
    enc.encode_field(&b.stay.check_in.to_string())?;
    enc.encode_field(&b.stay.check_out.to_string())?;
    enc.encode_field(&b.total_price.to_string())?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&b.payment_id.map(|p| p.to_string()))?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&b.updated_at)
}

fn encode_payment(enc: &mut DataRowEncoder, p: Payment) -> PgWireResult<()> {
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.user_id.to_string())?;
    enc.encode_field(&p.booking_id.map(|b| b.to_string()))?;
    enc.encode_field(&p.amount.to_string())?;
    enc.encode_field(&p.method.as_str())?;
    enc.encode_field(&p.status.as_str())?;
    enc.encode_field(&p.transaction_id)?;
    enc.encode_field(&p.created_at)?;
    enc.encode_field(&p.updated_at)
}

fn encode_room(enc: &mut DataRowEncoder, r: RoomInfo) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.hotel_id.to_string())?;
    enc.encode_field(&i64::from(r.number))?;
    enc.encode_field(&r.price_per_night.to_string())?;
    enc.encode_field(&i64::from(r.capacity))
}

fn encode_availability(
    enc: &mut DataRowEncoder,
    (room_id, stay, available): (ulid::Ulid, Stay, bool),
) -> PgWireResult<()> {
    enc.encode_field(&room_id.to_string())?;
    enc.encode_field(&stay.check_in.to_string())?;
    enc.encode_field(&stay.check_out.to_string())?;
    enc.encode_field(&available)
}

/// Result columns of a statement, picked from the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_end_matches(';'));
    match table {
        Some("bookings") => booking_schema(),
        Some("payments") => payment_schema(),
        Some("available_rooms") => room_schema(),
        Some("availability") => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaylockHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(actor, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaylockQueryParser;

#[async_trait]
impl QueryParser for StaylockQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
impl ExtendedQueryHandler for StaylockHandler {
    type Statement = String;
    type QueryParser = StaylockQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = inline_params(&portal.statement.statement, &portal.parameters);
        self.run(actor, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// `(start, end, N)` byte spans in statement order.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which keeps us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i, end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// original statement, so bound values are never scanned for placeholders.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaylockFactory {
    handler: Arc<StaylockHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaylockAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaylockFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(StaylockHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StaylockAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaylockFactory {
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
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = StaylockFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
