use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::MonthWindow;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProperty {
        id: Ulid,
        name: Option<String>,
        max_guests: Option<u32>,
    },
    UpdateProperty {
        id: Ulid,
        patch: PropertyPatch,
    },
    DeleteProperty {
        id: Ulid,
    },
    SelectProperties,
    InsertReservation {
        new: NewReservation,
        status: ReservationStatus,
    },
    ConfirmReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        property_id: Option<Ulid>,
        status: Option<ReservationStatus>,
    },
    SelectConflicts {
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectCalendar {
        property_id: Option<Ulid>,
        year: i32,
        month: u32,
    },
    SelectAvailability {
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        min_nights: Option<i64>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "properties" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("properties", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = match values.get(1) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            let max_guests = match values.get(2) {
                Some(v) => parse_i64_or_null(v)?
                    .map(|n| {
                        u32::try_from(n).map_err(|_| SqlError::Parse(format!("{n} out of u32 range")))
                    })
                    .transpose()?,
                None => None,
            };
            Ok(Command::InsertProperty { id, name, max_guests })
        }
        "reservations" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("reservations", 7, values.len()));
            }
            let new = NewReservation {
                id: parse_ulid(&values[0])?,
                property_id: parse_ulid(&values[1])?,
                check_in: parse_date(&values[2])?,
                check_out: parse_date(&values[3])?,
                guest_count: parse_u32(&values[4])?,
                email: parse_string(&values[5])?,
                total_price: parse_i64(&values[6])?,
                special_requests: match values.get(7) {
                    Some(v) => parse_string_or_null(v)?,
                    None => None,
                },
            };
            let status = match values.get(8) {
                Some(v) => match parse_string_or_null(v)? {
                    Some(s) => parse_status(&s)?,
                    None => ReservationStatus::Requested,
                },
                None => ReservationStatus::Requested,
            };
            Ok(Command::InsertReservation { new, status })
        }
        "confirmations" => {
            if values.len() != 1 {
                return Err(SqlError::WrongArity("confirmations", 1, values.len()));
            }
            Ok(Command::ConfirmReservation { id: parse_ulid(&values[0])? })
        }
        "cancellations" => {
            if values.len() != 1 {
                return Err(SqlError::WrongArity("cancellations", 1, values.len()));
            }
            Ok(Command::CancelReservation { id: parse_ulid(&values[0])? })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE properties SET name = .., max_guests = .. WHERE id = ..`
fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table_name = table_factor_name(&table.relation)?;
    if table_name != "properties" {
        return Err(SqlError::Unsupported(format!("UPDATE {table_name}")));
    }
    let id = extract_where_id(selection)?;

    let mut patch = PropertyPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
            ast::AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("assignment {assignment}")))?;
        match column.as_str() {
            "name" => patch.name = Some(parse_string_or_null(&assignment.value)?),
            "max_guests" => {
                patch.max_guests = Some(
                    parse_i64_or_null(&assignment.value)?
                        .map(|n| {
                            u32::try_from(n)
                                .map_err(|_| SqlError::Parse(format!("{n} out of u32 range")))
                        })
                        .transpose()?,
                )
            }
            other => return Err(SqlError::Unsupported(format!("cannot update column {other}"))),
        }
    }
    if patch == PropertyPatch::default() {
        return Err(SqlError::Parse("UPDATE without assignments".into()));
    }
    Ok(Command::UpdateProperty { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "properties" => Ok(Command::DeleteProperty { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Values collected from a `WHERE` clause of ANDed comparisons.
#[derive(Default)]
struct Filters {
    property_id: Option<Ulid>,
    status: Option<ReservationStatus>,
    check_in: Option<NaiveDate>,
    check_out: Option<NaiveDate>,
    month: Option<MonthWindow>,
    min_nights: Option<i64>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "properties" => Ok(Command::SelectProperties),
        "reservations" => Ok(Command::SelectReservations {
            property_id: f.property_id,
            status: f.status,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            property_id: f.property_id.ok_or(SqlError::MissingFilter("property_id"))?,
            check_in: f.check_in.ok_or(SqlError::MissingFilter("check_in"))?,
            check_out: f.check_out.ok_or(SqlError::MissingFilter("check_out"))?,
        }),
        "calendar" => {
            let month = f.month.ok_or(SqlError::MissingFilter("month"))?;
            Ok(Command::SelectCalendar {
                property_id: f.property_id,
                year: month.year(),
                month: month.month(),
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            property_id: f.property_id.ok_or(SqlError::MissingFilter("property_id"))?,
            start: f.check_in.ok_or(SqlError::MissingFilter("check_in"))?,
            end: f.check_out.ok_or(SqlError::MissingFilter("check_out"))?,
            min_nights: f.min_nights,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `check_in` and `check_out` are accepted with `=` (conflict probe) or as
/// `check_in >=` / `check_out <=` bounds (availability window).
fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, f)?;
                extract_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("property_id") => f.property_id = Some(parse_ulid_expr(right)?),
                Some("status") => f.status = Some(parse_status(&parse_string(right)?)?),
                Some("check_in") => f.check_in = Some(parse_date(right)?),
                Some("check_out") => f.check_out = Some(parse_date(right)?),
                Some("min_nights") => f.min_nights = Some(parse_i64_expr(right)?),
                Some("month") => {
                    let raw = parse_string(right)?;
                    f.month = Some(
                        MonthWindow::parse(&raw)
                            .ok_or_else(|| SqlError::Parse(format!("bad month: {raw}")))?,
                    );
                }
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("check_in") {
                    f.check_in = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("check_out") {
                    f.check_out = Some(parse_date(right)?);
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => extract_filters(inner, f)?,
        _ => {}
    }
    Ok(())
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// The single VALUES row of an INSERT.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64_expr(expr)?)),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_string(expr)?)),
    }
}

/// Calendar date as `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_status(s: &str) -> Result<ReservationStatus, SqlError> {
    ReservationStatus::parse(s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
