use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, FunctionArg, FunctionArgExpr, FunctionArguments,
    ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{EquipmentPatch, NewReservation, PackingLine};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEquipment {
        id: Ulid,
        name: Option<String>,
        track_type: TrackType,
        total_quantity: u32,
    },
    UpdateEquipment {
        id: Ulid,
        patch: EquipmentPatch,
    },
    DeleteEquipment {
        id: Ulid,
    },
    /// Raw `event_equipment` rows, written without an availability check.
    InsertReservations {
        rows: Vec<NewReservation>,
    },
    DeleteReservation {
        id: Ulid,
    },
    DeleteEventReservations {
        event_id: Ulid,
    },
    /// Checked save of an event's whole packing list.
    SavePackingList {
        event_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        lines: Vec<PackingLine>,
    },
    SelectEquipment,
    SelectReservations {
        filter: ReservationFilter,
    },
    CheckBookedQuantity {
        equipment_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        exclude_event_id: Option<Ulid>,
    },
    SelectAvailability {
        equipment_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        quantity: i64,
        exclude: Option<Exclusion>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    Equipment(Ulid),
    Event(Ulid),
}

const EQUIPMENT_COLUMNS: &[&str] = &["id", "name", "track_type", "total_quantity"];
const EVENT_EQUIPMENT_COLUMNS: &[&str] =
    &["id", "event_id", "equipment_id", "quantity", "start_date", "end_date"];
const PACKING_LIST_COLUMNS: &[&str] =
    &["event_id", "equipment_id", "quantity", "start_date", "end_date"];
const BOOKED_QUANTITY_PARAMS: &[&str] =
    &["p_equipment_id", "p_start_date", "p_end_date", "p_exclude_event_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "equipment" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("multi-row INSERT into equipment".into()));
            }
            let row = bind_row("equipment", EQUIPMENT_COLUMNS, &insert.columns, &rows[0])?;
            let track_type = match row.get("track_type") {
                Some(e) => parse_track_type(e)?,
                None => TrackType::Bulk,
            };
            let total_quantity = match row.get("total_quantity") {
                Some(e) => parse_u32(e)?,
                None => 1,
            };
            Ok(Command::InsertEquipment {
                id: parse_ulid(row.require("id")?)?,
                name: match row.get("name") {
                    Some(e) => parse_string_or_null(e)?,
                    None => None,
                },
                track_type,
                total_quantity,
            })
        }
        "event_equipment" => {
            let mut out = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = bind_row("event_equipment", EVENT_EQUIPMENT_COLUMNS, &insert.columns, values)?;
                out.push(reservation_row(&row).map_err(|e| e.in_row(i))?);
            }
            Ok(Command::InsertReservations { rows: out })
        }
        "packing_lists" => parse_packing_list(insert, &rows),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn reservation_row(row: &Row<'_>) -> Result<NewReservation, SqlError> {
    Ok(NewReservation {
        id: parse_ulid(row.require("id")?)?,
        event_id: parse_ulid(row.require("event_id")?)?,
        resource_id: parse_ulid(row.require("equipment_id")?)?,
        quantity: parse_i64(row.require("quantity")?)?,
        window: parse_window(row.require("start_date")?, row.require("end_date")?)?,
    })
}

/// Every row belongs to the same event and carries the event's dates.
fn parse_packing_list(insert: &ast::Insert, rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut header: Option<(Ulid, NaiveDate, NaiveDate)> = None;
    let mut lines = Vec::with_capacity(rows.len());

    for (i, values) in rows.iter().enumerate() {
        let row = bind_row("packing_lists", PACKING_LIST_COLUMNS, &insert.columns, values)?;
        let line = (|| {
            let event_id = parse_ulid(row.require("event_id")?)?;
            let start = parse_date(row.require("start_date")?)?;
            let end = parse_date(row.require("end_date")?)?;
            let line = PackingLine {
                resource_id: parse_ulid(row.require("equipment_id")?)?,
                quantity: parse_i64(row.require("quantity")?)?,
            };
            Ok::<_, SqlError>(((event_id, start, end), line))
        })()
        .map_err(|e| e.in_row(i))?;

        match header {
            None => header = Some(line.0),
            Some(h) if h == line.0 => {}
            Some(_) => {
                return Err(SqlError::Parse(format!(
                    "row {i}: packing list rows must share event_id, start_date and end_date"
                )));
            }
        }
        lines.push(line.1);
    }

    let (event_id, start, end) = header.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::SavePackingList {
        event_id,
        start,
        end,
        lines,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "equipment" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = EquipmentPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "name" => patch.name = Some(parse_string_or_null(value)?),
            "track_type" => patch.track_type = Some(parse_track_type(value)?),
            "total_quantity" => patch.total_quantity = Some(parse_u32(value)?),
            "current_available" => patch.current_available = Some(parse_u32(value)?),
            _ => return Err(SqlError::UnknownColumn("equipment", column)),
        }
    }
    if patch == EquipmentPatch::default() {
        return Err(SqlError::Parse("UPDATE without assignments".into()));
    }
    Ok(Command::UpdateEquipment { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "equipment" => Ok(Command::DeleteEquipment {
            id: extract_where_id(&delete.selection)?,
        }),
        "event_equipment" => {
            let (column, id) = extract_where_eq(&delete.selection, &["id", "event_id"])?;
            if column == "id" {
                Ok(Command::DeleteReservation { id })
            } else {
                Ok(Command::DeleteEventReservations { event_id: id })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return parse_function_select(&select.projection);
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "equipment" => Ok(Command::SelectEquipment),
        "event_equipment" => {
            let (column, id) = extract_where_eq(&select.selection, &["equipment_id", "event_id"])?;
            let filter = if column == "equipment_id" {
                ReservationFilter::Equipment(id)
            } else {
                ReservationFilter::Event(id)
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" => {
            let mut filters = AvailabilityFilters::default();
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut filters)?;
            }
            let exclude = match (filters.exclude_event_id, filters.exclude_reservation_id) {
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse(
                        "exclude_event_id and exclude_reservation_id are mutually exclusive".into(),
                    ));
                }
                (Some(id), None) => Some(Exclusion::Event(id)),
                (None, Some(id)) => Some(Exclusion::Reservation(id)),
                (None, None) => None,
            };
            Ok(Command::SelectAvailability {
                equipment_id: filters.equipment_id.ok_or(SqlError::MissingFilter("equipment_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start_date"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end_date"))?,
                quantity: filters.quantity.ok_or(SqlError::MissingFilter("quantity"))?,
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SELECT check_equipment_booked_quantity(...)`, positional or with the
/// `p_*` parameter names.
fn parse_function_select(projection: &[SelectItem]) -> Result<Command, SqlError> {
    let expr = match projection {
        [SelectItem::UnnamedExpr(e)] | [SelectItem::ExprWithAlias { expr: e, .. }] => e,
        _ => return Err(SqlError::Parse("SELECT without FROM".into())),
    };
    let Expr::Function(func) = expr else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let name = object_name_last(&func.name).unwrap_or_default();
    if name != "check_equipment_booked_quantity" {
        return Err(SqlError::UnknownFunction(name));
    }
    let FunctionArguments::List(list) = &func.args else {
        return Err(SqlError::WrongArity("check_equipment_booked_quantity", 3, 0));
    };

    let mut args: [Option<&Expr>; 4] = [None; 4];
    for (i, arg) in list.args.iter().enumerate() {
        let (slot, expr) = match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => (i, e),
            FunctionArg::Named {
                name,
                arg: FunctionArgExpr::Expr(e),
                ..
            } => {
                let param = name.value.to_lowercase();
                let slot = BOOKED_QUANTITY_PARAMS
                    .iter()
                    .position(|p| *p == param)
                    .ok_or_else(|| SqlError::UnknownColumn("check_equipment_booked_quantity", param))?;
                (slot, e)
            }
            _ => return Err(SqlError::Parse(format!("unsupported argument: {arg}"))),
        };
        if slot >= args.len() {
            return Err(SqlError::WrongArity("check_equipment_booked_quantity", 4, list.args.len()));
        }
        args[slot] = Some(expr);
    }

    let [Some(equipment_id), Some(start), Some(end), exclude] = args else {
        return Err(SqlError::WrongArity("check_equipment_booked_quantity", 3, list.args.len()));
    };
    Ok(Command::CheckBookedQuantity {
        equipment_id: parse_ulid(equipment_id)?,
        start: parse_date(start)?,
        end: parse_date(end)?,
        exclude_event_id: match exclude {
            Some(e) => parse_ulid_or_null(e)?,
            None => None,
        },
    })
}

#[derive(Default)]
struct AvailabilityFilters {
    equipment_id: Option<Ulid>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    quantity: Option<i64>,
    exclude_event_id: Option<Ulid>,
    exclude_reservation_id: Option<Ulid>,
}

fn extract_availability_filters(expr: &Expr, f: &mut AvailabilityFilters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_availability_filters(inner, f)?,
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    extract_availability_filters(left, f)?;
                    extract_availability_filters(right, f)?;
                }
                (ast::BinaryOperator::Eq, Some("equipment_id")) => {
                    f.equipment_id = Some(parse_ulid(right)?);
                }
                (ast::BinaryOperator::Eq, Some("quantity")) => {
                    f.quantity = Some(parse_i64(right)?);
                }
                (ast::BinaryOperator::Eq, Some("exclude_event_id")) => {
                    f.exclude_event_id = parse_ulid_or_null(right)?;
                }
                (ast::BinaryOperator::Eq, Some("exclude_reservation_id")) => {
                    f.exclude_reservation_id = parse_ulid_or_null(right)?;
                }
                (ast::BinaryOperator::GtEq | ast::BinaryOperator::Eq, Some("start_date")) => {
                    f.start = Some(parse_date(right)?);
                }
                (ast::BinaryOperator::LtEq | ast::BinaryOperator::Eq, Some("end_date")) => {
                    f.end = Some(parse_date(right)?);
                }
                _ => return Err(SqlError::Unsupported(format!("availability filter: {expr}"))),
            }
        }
        _ => return Err(SqlError::Unsupported(format!("availability filter: {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row with its column names attached.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Pair values with the INSERT's column list, or with the table's column
/// order when the statement names none.
fn bind_row<'a>(
    table: &'static str,
    table_columns: &[&str],
    columns: &[ast::Ident],
    values: &'a [Expr],
) -> Result<Row<'a>, SqlError> {
    let names: Vec<String> = if columns.is_empty() {
        if values.len() > table_columns.len() {
            return Err(SqlError::WrongArity(table, table_columns.len(), values.len()));
        }
        table_columns.iter().map(|c| c.to_string()).collect()
    } else {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        let mut names = Vec::with_capacity(columns.len());
        for ident in columns {
            let name = ident.value.to_lowercase();
            if !table_columns.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            names.push(name);
        }
        names
    };
    Ok(Row {
        table,
        cells: names.into_iter().zip(values.iter()).collect(),
    })
}

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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    extract_where_eq(selection, &["id"]).map(|(_, id)| id)
}

/// A `WHERE <column> = '<ulid>'` clause over one of `columns`.
fn extract_where_eq(
    selection: &Option<Expr>,
    columns: &[&'static str],
) -> Result<(&'static str, Ulid), SqlError> {
    let missing = SqlError::MissingFilter(columns[0]);
    let Some(Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    }) = selection
    else {
        return Err(missing);
    };
    let Some(col) = expr_column_name(left) else {
        return Err(missing);
    };
    let Some(column) = columns.iter().find(|c| **c == col) else {
        return Err(missing);
    };
    Ok((column, parse_ulid(right)?))
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected integer, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::OutOfRange(v))
}

fn parse_track_type(expr: &Expr) -> Result<TrackType, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(SqlError::Parse),
        Some(value) => Err(SqlError::Parse(format!("expected track type, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Both dates of a stored row. Reversed dates are left for the engine to refuse.
fn parse_window(start: &Expr, end: &Expr) -> Result<DateWindow, SqlError> {
    let (start, end) = (parse_date(start)?, parse_date(end)?);
    DateWindow::try_new(start, end).ok_or(SqlError::ReversedWindow(start, end))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("value {0} out of range")]
    OutOfRange(i64),
    #[error("start_date {0} is after end_date {1}")]
    ReversedWindow(NaiveDate, NaiveDate),
}

impl SqlError {
    /// Whether the statement parsed but carried a value the domain refuses.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SqlError::OutOfRange(_) | SqlError::ReversedWindow(..))
    }

    fn in_row(self, row: usize) -> SqlError {
        match self {
            SqlError::Parse(msg) => SqlError::Parse(format!("row {row}: {msg}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EQ: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const EV: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_equipment() {
        let sql = format!(
            "INSERT INTO equipment (id, name, track_type, total_quantity) VALUES ('{EQ}', 'LED par', 'bulk', 24)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertEquipment {
                id: ulid(EQ),
                name: Some("LED par".into()),
                track_type: TrackType::Bulk,
                total_quantity: 24,
            }
        );
    }

    #[test]
    fn parse_insert_equipment_defaults() {
        let sql = format!("INSERT INTO equipment (id) VALUES ('{EQ}')");
        match parse_sql(&sql).unwrap() {
            Command::InsertEquipment {
                name,
                track_type,
                total_quantity,
                ..
            } => {
                assert_eq!(name, None);
                assert_eq!(track_type, TrackType::Bulk);
                assert_eq!(total_quantity, 1);
            }
            cmd => panic!("expected InsertEquipment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_equipment_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO equipment (total_quantity, id, track_type) VALUES (3, '{EQ}', 'kit')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertEquipment {
                id,
                track_type,
                total_quantity,
                ..
            } => {
                assert_eq!(id, ulid(EQ));
                assert_eq!(track_type, TrackType::Kit);
                assert_eq!(total_quantity, 3);
            }
            cmd => panic!("expected InsertEquipment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_equipment_negative_stock_is_invalid_input() {
        let sql = format!("INSERT INTO equipment (id, total_quantity) VALUES ('{EQ}', -1)");
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.is_invalid_input(), "{err}");
    }

    #[test]
    fn parse_insert_equipment_bad_track_type() {
        let sql = format!("INSERT INTO equipment (id, track_type) VALUES ('{EQ}', 'pallet')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_equipment() {
        let sql = format!(
            "UPDATE equipment SET total_quantity = 8, current_available = 6, name = NULL WHERE id = '{EQ}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateEquipment {
                id: ulid(EQ),
                patch: EquipmentPatch {
                    name: Some(None),
                    track_type: None,
                    total_quantity: Some(8),
                    current_available: Some(6),
                },
            }
        );
    }

    #[test]
    fn parse_update_unknown_column() {
        let sql = format!("UPDATE equipment SET colour = 'red' WHERE id = '{EQ}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(..))));
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE equipment SET total_quantity = 2";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_equipment() {
        let sql = format!("DELETE FROM equipment WHERE id = '{EQ}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteEquipment { id: ulid(EQ) });
    }

    #[test]
    fn parse_insert_event_equipment_rows() {
        let r1 = Ulid::new();
        let r2 = Ulid::new();
        let sql = format!(
            "INSERT INTO event_equipment (id, event_id, equipment_id, quantity, start_date, end_date) VALUES \
             ('{r1}', '{EV}', '{EQ}', 4, '2024-05-01', '2024-05-03'), \
             ('{r2}', '{EV}', '{EQ}', 2, '2024-05-01', '2024-05-03')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservations { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].id, r1);
                assert_eq!(rows[0].event_id, ulid(EV));
                assert_eq!(rows[0].resource_id, ulid(EQ));
                assert_eq!(rows[0].quantity, 4);
                assert_eq!(rows[1].window, DateWindow::new(d("2024-05-01"), d("2024-05-03")));
            }
            cmd => panic!("expected InsertReservations, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_event_equipment_reversed_dates() {
        let sql = format!(
            "INSERT INTO event_equipment VALUES ('{}', '{EV}', '{EQ}', 1, '2024-05-03', '2024-05-01')",
            Ulid::new()
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::ReversedWindow(..)));
        assert!(err.is_invalid_input());
    }

    #[test]
    fn parse_event_equipment_missing_column() {
        let sql = format!(
            "INSERT INTO event_equipment (id, event_id, equipment_id, quantity) VALUES ('{}', '{EV}', '{EQ}', 1)",
            Ulid::new()
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("event_equipment", "start_date"))
        ));
    }

    #[test]
    fn parse_delete_event_equipment_by_id_or_event() {
        let sql = format!("DELETE FROM event_equipment WHERE id = '{EQ}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteReservation { id: ulid(EQ) });

        let sql = format!("DELETE FROM event_equipment WHERE event_id = '{EV}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteEventReservations { event_id: ulid(EV) }
        );
    }

    #[test]
    fn parse_packing_list() {
        let other = Ulid::new();
        let sql = format!(
            "INSERT INTO packing_lists (event_id, equipment_id, quantity, start_date, end_date) VALUES \
             ('{EV}', '{EQ}', 3, '2024-05-01', '2024-05-03'), \
             ('{EV}', '{other}', 0, '2024-05-01', '2024-05-03')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SavePackingList {
                event_id: ulid(EV),
                start: d("2024-05-01"),
                end: d("2024-05-03"),
                lines: vec![
                    PackingLine { resource_id: ulid(EQ), quantity: 3 },
                    PackingLine { resource_id: other, quantity: 0 },
                ],
            }
        );
    }

    #[test]
    fn parse_packing_list_rows_must_agree() {
        let sql = format!(
            "INSERT INTO packing_lists VALUES \
             ('{EV}', '{EQ}', 3, '2024-05-01', '2024-05-03'), \
             ('{EV}', '{EQ}', 1, '2024-05-02', '2024-05-03')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[test]
    fn parse_select_equipment() {
        assert_eq!(parse_sql("SELECT * FROM equipment").unwrap(), Command::SelectEquipment);
    }

    #[test]
    fn parse_select_event_equipment() {
        let sql = format!("SELECT * FROM event_equipment WHERE equipment_id = '{EQ}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations {
                filter: ReservationFilter::Equipment(ulid(EQ))
            }
        );
        let sql = format!("SELECT * FROM event_equipment WHERE event_id = '{EV}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations {
                filter: ReservationFilter::Event(ulid(EV))
            }
        );
    }

    #[test]
    fn parse_check_booked_quantity_positional() {
        let sql = format!(
            "SELECT check_equipment_booked_quantity('{EQ}', '2024-05-02', '2024-05-02', NULL)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CheckBookedQuantity {
                equipment_id: ulid(EQ),
                start: d("2024-05-02"),
                end: d("2024-05-02"),
                exclude_event_id: None,
            }
        );
    }

    #[test]
    fn parse_check_booked_quantity_named() {
        let sql = format!(
            "SELECT check_equipment_booked_quantity(p_exclude_event_id => '{EV}', \
             p_equipment_id => '{EQ}', p_start_date => '2024-05-01', p_end_date => '2024-05-03')"
        );
        match parse_sql(&sql).unwrap() {
            Command::CheckBookedQuantity {
                equipment_id,
                exclude_event_id,
                ..
            } => {
                assert_eq!(equipment_id, ulid(EQ));
                assert_eq!(exclude_event_id, Some(ulid(EV)));
            }
            cmd => panic!("expected CheckBookedQuantity, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_check_booked_quantity_too_few_args() {
        let sql = format!("SELECT check_equipment_booked_quantity('{EQ}', '2024-05-02')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(..))));
    }

    #[test]
    fn parse_unknown_function() {
        assert!(matches!(
            parse_sql("SELECT now()"),
            Err(SqlError::UnknownFunction(_))
        ));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE equipment_id = '{EQ}' AND start_date >= '2024-05-01' \
             AND end_date <= '2024-05-03' AND quantity = 5 AND exclude_event_id = '{EV}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                equipment_id: ulid(EQ),
                start: d("2024-05-01"),
                end: d("2024-05-03"),
                quantity: 5,
                exclude: Some(Exclusion::Event(ulid(EV))),
            }
        );
    }

    #[test]
    fn parse_select_availability_negative_quantity_reaches_engine() {
        let sql = format!(
            "SELECT * FROM availability WHERE equipment_id = '{EQ}' AND start_date >= '2024-05-01' \
             AND end_date <= '2024-05-01' AND quantity = -2"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability { quantity, exclude, .. } => {
                assert_eq!(quantity, -2);
                assert_eq!(exclude, None);
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_missing_quantity() {
        let sql = format!(
            "SELECT * FROM availability WHERE equipment_id = '{EQ}' AND start_date >= '2024-05-01' \
             AND end_date <= '2024-05-03'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("quantity"))));
    }

    #[test]
    fn parse_select_availability_both_exclusions() {
        let sql = format!(
            "SELECT * FROM availability WHERE equipment_id = '{EQ}' AND start_date >= '2024-05-01' \
             AND end_date <= '2024-05-03' AND quantity = 1 AND exclude_event_id = '{EV}' \
             AND exclude_reservation_id = '{EQ}'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_bad_date() {
        let sql = format!(
            "SELECT check_equipment_booked_quantity('{EQ}', '2024-13-01', '2024-05-02', NULL)"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("bad date"), "{err}");
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{EQ}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
