use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SettleOutcome;
use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        stay: Stay,
        total_price: Option<Decimal>,
    },
    CancelBooking {
        id: Ulid,
    },
    RescheduleBooking {
        id: Ulid,
        room_id: Option<Ulid>,
        stay: Stay,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        filter: BookingFilter,
    },
    InsertPayment {
        id: Ulid,
        amount: Decimal,
        method: PaymentMethod,
        booking_id: Option<Ulid>,
    },
    LinkPayment {
        id: Ulid,
        booking_id: Ulid,
    },
    SettlePayment {
        id: Ulid,
        outcome: SettleOutcome,
        transaction_id: Option<String>,
    },
    RefundPayment {
        id: Ulid,
    },
    DeletePayment {
        id: Ulid,
    },
    SelectPayments {
        id: Option<Ulid>,
        filter: PaymentFilter,
    },
    SelectAvailableRooms {
        query: RoomQuery,
    },
    SelectAvailability {
        room_id: Ulid,
        stay: Stay,
        exclude: Option<Ulid>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::Unsupported("statement too long".into()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column/value pairs of a single-row INSERT. Without a column list the
/// table's default column order applies.
fn insert_row(insert: &ast::Insert, default_columns: &[&str]) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match rows.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn take<'a>(pairs: &'a [(String, Expr)], column: &str) -> Option<&'a Expr> {
    pairs.iter().find(|(c, _)| c == column).map(|(_, e)| e)
}

fn require<'a>(pairs: &'a [(String, Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    take(pairs, column).ok_or(SqlError::MissingValue(column))
}

fn reject_unknown(pairs: &[(String, Expr)], known: &[&str]) -> Result<(), SqlError> {
    match pairs.iter().find(|(c, _)| !known.contains(&c.as_str())) {
        Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
        None => Ok(()),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "bookings" => {
            const COLUMNS: &[&str] = &["id", "room_id", "check_in", "check_out", "total_price"];
            let row = insert_row(insert, COLUMNS)?;
            reject_unknown(&row, COLUMNS)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(require(&row, "id")?)?,
                room_id: parse_ulid(require(&row, "room_id")?)?,
                stay: Stay::new(
                    parse_date(require(&row, "check_in")?)?,
                    parse_date(require(&row, "check_out")?)?,
                ),
                total_price: take(&row, "total_price").map(parse_decimal_or_null).transpose()?.flatten(),
            })
        }
        "payments" => {
            const COLUMNS: &[&str] = &["id", "amount", "method", "booking_id"];
            let row = insert_row(insert, COLUMNS)?;
            reject_unknown(&row, COLUMNS)?;
            Ok(Command::InsertPayment {
                id: parse_ulid(require(&row, "id")?)?,
                amount: parse_decimal(require(&row, "amount")?)?,
                method: parse_enum(require(&row, "method")?)?,
                booking_id: take(&row, "booking_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(table)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, assignment.value.clone()));
    }

    match table.as_str() {
        "bookings" => {
            reject_unknown(&set, &["status", "check_in", "check_out", "room_id"])?;
            if let Some(status) = take(&set, "status") {
                if set.len() > 1 {
                    return Err(SqlError::Unsupported("status must be updated on its own".into()));
                }
                return match parse_enum::<BookingStatus>(status)? {
                    BookingStatus::Cancelled => Ok(Command::CancelBooking { id }),
                    other => Err(SqlError::Unsupported(format!("cannot set booking status to {other}"))),
                };
            }
            Ok(Command::RescheduleBooking {
                id,
                room_id: take(&set, "room_id").map(parse_ulid).transpose()?,
                stay: Stay::new(
                    parse_date(require(&set, "check_in")?)?,
                    parse_date(require(&set, "check_out")?)?,
                ),
            })
        }
        "payments" => {
            reject_unknown(&set, &["status", "transaction_id", "booking_id"])?;
            if let Some(booking_id) = take(&set, "booking_id") {
                if set.len() > 1 {
                    return Err(SqlError::Unsupported("booking_id must be updated on its own".into()));
                }
                return Ok(Command::LinkPayment { id, booking_id: parse_ulid(booking_id)? });
            }
            let status = parse_enum::<PaymentStatus>(require(&set, "status")?)?;
            let transaction_id = take(&set, "transaction_id")
                .map(parse_string_or_null)
                .transpose()?
                .flatten();
            match status {
                PaymentStatus::Completed => Ok(Command::SettlePayment {
                    id,
                    outcome: SettleOutcome::Completed,
                    transaction_id,
                }),
                PaymentStatus::Failed => Ok(Command::SettlePayment {
                    id,
                    outcome: SettleOutcome::Failed,
                    transaction_id,
                }),
                PaymentStatus::Refunded if transaction_id.is_none() => Ok(Command::RefundPayment { id }),
                PaymentStatus::Refunded => Err(SqlError::Unsupported(
                    "transaction_id is set at settlement, not refund".into(),
                )),
                PaymentStatus::Pending => {
                    Err(SqlError::Unsupported("cannot set payment status to pending".into()))
                }
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "payments" => Ok(Command::DeletePayment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }

    match table.as_str() {
        "bookings" => {
            let (mut id, mut filter) = (None, BookingFilter::default());
            for (col, op, value) in &preds {
                match (col.as_str(), op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
                    ("user_id", BinaryOperator::Eq) => filter.user_id = Some(parse_ulid(value)?),
                    ("room_id", BinaryOperator::Eq) => filter.room_id = Some(parse_ulid(value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_enum(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectBookings { id, filter })
        }
        "payments" => {
            let (mut id, mut filter) = (None, PaymentFilter::default());
            for (col, op, value) in &preds {
                match (col.as_str(), op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_ulid(value)?),
                    ("user_id", BinaryOperator::Eq) => filter.user_id = Some(parse_ulid(value)?),
                    ("booking_id", BinaryOperator::Eq) => filter.booking_id = Some(parse_ulid(value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_enum(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectPayments { id, filter })
        }
        "available_rooms" => {
            let (mut check_in, mut check_out, mut hotel_id, mut min_capacity) = (None, None, None, None);
            for (col, op, value) in &preds {
                match (col.as_str(), op) {
                    ("check_in", BinaryOperator::Eq) => check_in = Some(parse_date(value)?),
                    ("check_out", BinaryOperator::Eq) => check_out = Some(parse_date(value)?),
                    ("hotel_id", BinaryOperator::Eq) => hotel_id = Some(parse_ulid(value)?),
                    ("capacity", BinaryOperator::GtEq) => min_capacity = Some(parse_u32(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectAvailableRooms {
                query: RoomQuery {
                    hotel_id,
                    stay: Stay::new(
                        check_in.ok_or(SqlError::MissingFilter("check_in"))?,
                        check_out.ok_or(SqlError::MissingFilter("check_out"))?,
                    ),
                    min_capacity,
                },
            })
        }
        "availability" => {
            let (mut room_id, mut check_in, mut check_out, mut exclude) = (None, None, None, None);
            for (col, op, value) in &preds {
                match (col.as_str(), op) {
                    ("room_id", BinaryOperator::Eq) => room_id = Some(parse_ulid(value)?),
                    ("check_in", BinaryOperator::Eq) => check_in = Some(parse_date(value)?),
                    ("check_out", BinaryOperator::Eq) => check_out = Some(parse_date(value)?),
                    ("exclude_booking_id", BinaryOperator::Eq) => exclude = Some(parse_ulid(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(col.clone())),
                }
            }
            Ok(Command::SelectAvailability {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                stay: Stay::new(
                    check_in.ok_or(SqlError::MissingFilter("check_in"))?,
                    check_out.ok_or(SqlError::MissingFilter("check_out"))?,
                ),
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_predicates(expr: &Expr, out: &mut Vec<(String, BinaryOperator, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, op.clone(), (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Text of a literal: quoted strings and bare numbers.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid(expr).map(Some) }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let text = match expr {
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => format!("-{}", literal_text(expr)?),
        _ => literal_text(expr)?.to_string(),
    };
    Decimal::from_str(&text).map_err(|e| SqlError::Parse(format!("bad amount {text:?}: {e}")))
}

fn parse_decimal_or_null(expr: &Expr) -> Result<Option<Decimal>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_decimal(expr).map(Some) }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = literal_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad count {s:?}: {e}")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_enum<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: FromStr<Err = UnknownVariant>,
{
    literal_text(expr)?
        .parse()
        .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(usize, usize),
    MissingValue(&'static str),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "unsupported filter on {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Unsupported(_) | SqlError::UnsupportedFilter(_) => "0A000",
            _ => "42601",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01J9Z8Q6M3V3K1X0S5N2B4C7D8";

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (id, room_id, check_in, check_out) VALUES ('{ID}', '{OTHER}', '2031-05-01', '2031-05-03')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { id, room_id, stay, total_price } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(room_id.to_string(), OTHER);
                assert_eq!(stay, Stay::new(date("2031-05-01"), date("2031-05-03")));
                assert_eq!(total_price, None);
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_with_price_any_column_order() {
        let sql = format!(
            "INSERT INTO bookings (total_price, check_out, check_in, room_id, id) VALUES (150.25, '2031-05-03', '2031-05-01', '{OTHER}', '{ID}')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { stay, total_price, .. } => {
                assert_eq!(stay.nights(), 2);
                assert_eq!(total_price, Some(Decimal::new(15025, 2)));
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_positional() {
        let sql = format!("INSERT INTO bookings VALUES ('{ID}', '{OTHER}', '2031-05-01', '2031-05-03')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertBooking { total_price: None, .. }));
    }

    #[test]
    fn parse_insert_booking_bad_date() {
        let sql = format!(
            "INSERT INTO bookings (id, room_id, check_in, check_out) VALUES ('{ID}', '{OTHER}', '2031-13-01', '2031-05-03')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_booking_missing_column() {
        let sql = format!("INSERT INTO bookings (id, room_id, check_in) VALUES ('{ID}', '{OTHER}', '2031-05-01')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingValue("check_out"))));
    }

    #[test]
    fn parse_insert_payment() {
        let sql = format!(
            "INSERT INTO payments (id, amount, method, booking_id) VALUES ('{ID}', '200.00', 'credit_card', '{OTHER}')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertPayment { amount, method, booking_id, .. } => {
                assert_eq!(amount, Decimal::from(200));
                assert_eq!(method, PaymentMethod::CreditCard);
                assert_eq!(booking_id.map(|b| b.to_string()), Some(OTHER.to_string()));
            }
            _ => panic!("expected InsertPayment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_payment_unknown_method() {
        let sql = format!("INSERT INTO payments (id, amount, method) VALUES ('{ID}', 10, 'barter')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_cancel_booking() {
        let sql = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CancelBooking { .. }));
    }

    #[test]
    fn parse_confirm_booking_is_rejected() {
        let sql = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_reschedule_booking() {
        let sql = format!(
            "UPDATE bookings SET check_in = '2031-06-01', check_out = '2031-06-04', room_id = '{OTHER}' WHERE id = '{ID}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::RescheduleBooking { room_id, stay, .. } => {
                assert_eq!(room_id.map(|r| r.to_string()), Some(OTHER.to_string()));
                assert_eq!(stay.nights(), 3);
            }
            _ => panic!("expected RescheduleBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE bookings SET status = 'cancelled' WHERE user_id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_settle_payment() {
        let sql = format!("UPDATE payments SET status = 'completed', transaction_id = 'tx-991' WHERE id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SettlePayment { outcome, transaction_id, .. } => {
                assert_eq!(outcome, SettleOutcome::Completed);
                assert_eq!(transaction_id.as_deref(), Some("tx-991"));
            }
            _ => panic!("expected SettlePayment, got {cmd:?}"),
        }

        let sql = format!("UPDATE payments SET status = 'failed' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SettlePayment { outcome: SettleOutcome::Failed, transaction_id: None, .. }
        ));
    }

    #[test]
    fn parse_refund_and_link() {
        let sql = format!("UPDATE payments SET status = 'refunded' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::RefundPayment { .. }));

        let sql = format!("UPDATE payments SET booking_id = '{OTHER}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::LinkPayment { .. }));
    }

    #[test]
    fn parse_delete() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteBooking { .. }));
        let sql = format!("DELETE FROM payments WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeletePayment { .. }));
        let sql = format!("DELETE FROM available_rooms WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn multiple_statements_are_refused() {
        let sql = format!(
            "INSERT INTO bookings (id, room_id, check_in, check_out) VALUES ('{ID}', '{OTHER}', '2031-03-01', '2031-03-03'); DELETE FROM bookings WHERE id = '{ID}'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_bookings_filters() {
        let cmd = parse_sql("SELECT * FROM bookings WHERE status = 'pending' AND room_id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'")
            .unwrap();
        match cmd {
            Command::SelectBookings { id, filter } => {
                assert_eq!(id, None);
                assert_eq!(filter.status, Some(BookingStatus::Pending));
                assert!(filter.room_id.is_some());
                assert_eq!(filter.user_id, None);
            }
            _ => panic!("expected SelectBookings, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { id: None, .. }
        ));
    }

    #[test]
    fn parse_select_payments_by_id() {
        let sql = format!("SELECT * FROM payments WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectPayments { id: Some(_), .. }));
    }

    #[test]
    fn parse_select_available_rooms() {
        let sql = format!(
            "SELECT * FROM available_rooms WHERE check_in = '2031-05-01' AND check_out = '2031-05-03' AND hotel_id = '{ID}' AND capacity >= 3"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectAvailableRooms { query } => {
                assert_eq!(query.stay.nights(), 2);
                assert_eq!(query.min_capacity, Some(3));
                assert!(query.hotel_id.is_some());
            }
            _ => panic!("expected SelectAvailableRooms, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_available_rooms_requires_dates() {
        let sql = "SELECT * FROM available_rooms WHERE check_in = '2031-05-01'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("check_out"))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE room_id = '{ID}' AND check_in = '2031-05-01' AND check_out = '2031-05-02'"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability { exclude: None, .. }
        ));
    }

    #[test]
    fn parse_unsupported_filter() {
        let sql = "SELECT * FROM bookings WHERE total_price > 10";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnsupportedFilter(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO hotels (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
