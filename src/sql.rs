use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        username: String,
        email: Option<String>,
        role: Role,
    },
    UpdateUserRole {
        id: Ulid,
        role: Role,
    },
    DeleteUser {
        id: Ulid,
    },
    InsertEquipment {
        id: Ulid,
        name: String,
        description: Option<String>,
        is_available: bool,
    },
    UpdateEquipment {
        ids: Vec<Ulid>,
        patch: EquipmentPatch,
    },
    DeleteEquipment {
        id: Ulid,
    },
    InsertAdditionalEquipment {
        id: Ulid,
        name: String,
    },
    DeleteAdditionalEquipment {
        id: Ulid,
    },
    InsertReservation(NewReservation),
    BatchInsertReservations(Vec<NewReservation>),
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    MarkNotified {
        ids: Vec<Ulid>,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectEquipment {
        id: Option<Ulid>,
        is_available: Option<bool>,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    SelectAdditionalEquipment,
    SelectReservations(ReservationFilter),
}

/// `WHERE` filters accepted on `SELECT ... FROM reservations`.
///
/// `window` comes from `start_time < $end AND end_time > $start` and means
/// "reservations overlapping `[start, end)`"; it needs `equipment_id`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub equipment_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub notified: Option<bool>,
    pub window: Option<(Ms, Ms)>,
}

/// Table a read-only statement targets, used to pick a row schema before
/// the statement has been executed.
pub fn select_table(sql: &str) -> Option<&'static str> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let table = table_factor_name(&select.from.first()?.relation).ok()?;
    match table.as_str() {
        "equipment" => Some("equipment"),
        "users" => Some("users"),
        "additional_equipment" => Some("additional_equipment"),
        "reservations" => Some("reservations"),
        _ => None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
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

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "users" => {
            let values = single_row(&rows, "users")?;
            require_arity("users", values, 2)?;
            Ok(Command::InsertUser {
                id: parse_ulid_expr(&values[0])?,
                username: parse_string_expr(&values[1])?,
                email: values.get(2).map(parse_string_or_null).transpose()?.flatten(),
                role: values
                    .get(3)
                    .map(parse_role_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or(Role::User),
            })
        }
        "equipment" => {
            let values = single_row(&rows, "equipment")?;
            require_arity("equipment", values, 2)?;
            Ok(Command::InsertEquipment {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string_expr(&values[1])?,
                description: values.get(2).map(parse_string_or_null).transpose()?.flatten(),
                is_available: values.get(3).map(parse_bool).transpose()?.unwrap_or(true),
            })
        }
        "additional_equipment" => {
            let values = single_row(&rows, "additional_equipment")?;
            require_arity("additional_equipment", values, 2)?;
            Ok(Command::InsertAdditionalEquipment {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string_expr(&values[1])?,
            })
        }
        "reservations" => {
            if rows.len() == 1 {
                return Ok(Command::InsertReservation(parse_reservation_row(&rows[0])?));
            }
            let mut batch = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let new = parse_reservation_row(row).map_err(|e| match e {
                    SqlError::Parse(msg) => SqlError::Parse(format!("row {i}: {msg}")),
                    other => other,
                })?;
                batch.push(new);
            }
            Ok(Command::BatchInsertReservations(batch))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, equipment_id, user_id, test_name, temperature, start_time, end_time
/// [, additional_equipment])`
fn parse_reservation_row(values: &[Expr]) -> Result<NewReservation, SqlError> {
    require_arity("reservations", values, 7)?;
    Ok(NewReservation {
        id: parse_ulid_expr(&values[0])?,
        equipment_id: parse_ulid_expr(&values[1])?,
        user_id: parse_ulid_expr(&values[2])?,
        test_name: parse_string_expr(&values[3])?,
        temperature: parse_f64_expr(&values[4])?,
        start: parse_i64_expr(&values[5])?,
        end: parse_i64_expr(&values[6])?,
        additional_equipment: values
            .get(7)
            .map(parse_id_list)
            .transpose()?
            .unwrap_or_default(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        pairs.push((assignment_column(a)?, &a.value));
    }

    match table.as_str() {
        "users" => {
            let mut role = None;
            for (col, value) in &pairs {
                match col.as_str() {
                    "role" => role = Some(parse_role(value)?),
                    _ => return Err(SqlError::UnknownColumn("users", col.clone())),
                }
            }
            Ok(Command::UpdateUserRole {
                id: extract_where_id(selection)?,
                role: role.ok_or(SqlError::MissingColumn("role"))?,
            })
        }
        "equipment" => {
            let mut patch = EquipmentPatch::default();
            for (col, value) in &pairs {
                match col.as_str() {
                    "name" => patch.name = Some(parse_string_expr(value)?),
                    "description" => patch.description = Some(parse_string_or_null(value)?),
                    "is_available" => patch.is_available = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("equipment", col.clone())),
                }
            }
            Ok(Command::UpdateEquipment {
                ids: extract_where_ids(selection)?,
                patch,
            })
        }
        "reservations" => {
            if pairs.iter().any(|(col, _)| col == "notified") {
                if pairs.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "notified must be updated on its own".into(),
                    ));
                }
                if !parse_bool(pairs[0].1)? {
                    return Err(SqlError::Unsupported("notified cannot be cleared".into()));
                }
                return Ok(Command::MarkNotified {
                    ids: extract_where_ids(selection)?,
                });
            }

            let mut patch = ReservationPatch::default();
            for (col, value) in &pairs {
                match col.as_str() {
                    "equipment_id" => patch.equipment_id = Some(parse_ulid_expr(value)?),
                    "test_name" => patch.test_name = Some(parse_string_expr(value)?),
                    "temperature" => patch.temperature = Some(parse_f64_expr(value)?),
                    "start_time" => patch.start = Some(parse_i64_expr(value)?),
                    "end_time" => patch.end = Some(parse_i64_expr(value)?),
                    "additional_equipment" => {
                        patch.additional_equipment = Some(parse_id_list(value)?)
                    }
                    _ => return Err(SqlError::UnknownColumn("reservations", col.clone())),
                }
            }
            Ok(Command::UpdateReservation {
                id: extract_where_id(selection)?,
                patch,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(assignment: &Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "users" => Ok(Command::DeleteUser { id }),
        "equipment" => Ok(Command::DeleteEquipment { id }),
        "additional_equipment" => Ok(Command::DeleteAdditionalEquipment { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "equipment" => {
            filters.only(&["id", "is_available"], "equipment")?;
            Ok(Command::SelectEquipment {
                id: filters.id,
                is_available: filters.is_available,
            })
        }
        "users" => {
            filters.only(&["id"], "users")?;
            Ok(Command::SelectUsers { id: filters.id })
        }
        "additional_equipment" => {
            filters.only(&[], "additional_equipment")?;
            Ok(Command::SelectAdditionalEquipment)
        }
        "reservations" => {
            filters.only(
                &["id", "equipment_id", "user_id", "notified", "start_time", "end_time"],
                "reservations",
            )?;
            let window = match (filters.window_start, filters.window_end) {
                (None, None) => None,
                (Some(start), Some(end)) => Some((start, end)),
                (None, Some(_)) => return Err(SqlError::MissingFilter("end_time")),
                (Some(_), None) => return Err(SqlError::MissingFilter("start_time")),
            };
            if window.is_some() && filters.equipment_id.is_none() {
                return Err(SqlError::MissingFilter("equipment_id"));
            }
            Ok(Command::SelectReservations(ReservationFilter {
                id: filters.id,
                equipment_id: filters.equipment_id,
                user_id: filters.user_id,
                notified: filters.notified,
                window,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    equipment_id: Option<Ulid>,
    user_id: Option<Ulid>,
    notified: Option<bool>,
    is_available: Option<bool>,
    /// From `end_time > X`: the window starts at X.
    window_start: Option<Ms>,
    /// From `start_time < Y`: the window ends at Y.
    window_end: Option<Ms>,
    seen: Vec<&'static str>,
}

impl Filters {
    /// Reject filters the table does not support.
    fn only(&self, allowed: &[&str], table: &'static str) -> Result<(), SqlError> {
        match self.seen.iter().find(|c| !allowed.contains(*c)) {
            Some(col) => Err(SqlError::UnknownColumn(table, col.to_string())),
            None => Ok(()),
        }
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    collect_filters(left, filters)?;
                    collect_filters(right, filters)
                }
                (ast::BinaryOperator::Eq, Some("id")) => {
                    filters.id = Some(parse_ulid_expr(right)?);
                    filters.seen.push("id");
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("equipment_id")) => {
                    filters.equipment_id = Some(parse_ulid_expr(right)?);
                    filters.seen.push("equipment_id");
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("user_id")) => {
                    filters.user_id = Some(parse_ulid_expr(right)?);
                    filters.seen.push("user_id");
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("notified")) => {
                    filters.notified = Some(parse_bool(right)?);
                    filters.seen.push("notified");
                    Ok(())
                }
                (ast::BinaryOperator::Eq, Some("is_available")) => {
                    filters.is_available = Some(parse_bool(right)?);
                    filters.seen.push("is_available");
                    Ok(())
                }
                (ast::BinaryOperator::Gt, Some("end_time")) => {
                    filters.window_start = Some(parse_i64_expr(right)?);
                    filters.seen.push("end_time");
                    Ok(())
                }
                (ast::BinaryOperator::Lt, Some("start_time")) => {
                    filters.window_end = Some(parse_i64_expr(right)?);
                    filters.seen.push("start_time");
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
            }
        }
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        ))),
    }
}

fn require_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

/// `WHERE id = '..'`
fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

/// `WHERE id = '..'` or `WHERE id IN ('..', '..')`
fn extract_where_ids(selection: &Option<Expr>) -> Result<Vec<Ulid>, SqlError> {
    match selection {
        Some(Expr::InList {
            expr,
            list,
            negated: false,
        }) if expr_column_name(expr).as_deref() == Some("id") => {
            if list.is_empty() {
                return Err(SqlError::MissingFilter("id"));
            }
            list.iter().map(parse_ulid_expr).collect()
        }
        _ => Ok(vec![extract_where_id(selection)?]),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    let s = parse_string_expr(expr)?;
    Role::parse(s.trim()).ok_or_else(|| SqlError::Parse(format!("bad role: {s}")))
}

fn parse_role_or_null(expr: &Expr) -> Result<Option<Role>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_role(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_f64_expr(expr: &Expr) -> Result<f64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_f64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// Comma-separated ULIDs in one string; NULL or '' is the empty set.
fn parse_id_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let Some(s) = parse_string_or_null(expr)? else {
        return Ok(Vec::new());
    };
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part}: {e}")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
