//! Value representation helpers.
//!
//! Cell values are plain `serde_json::Value`s produced by language contexts;
//! the engine itself only parses constants and assembles range values.

use serde_json::{json, Map, Value};

/// Parses a constant cell's text as a literal of inferred type.
///
/// Tried in order: boolean, integer, float; anything else is a string.
pub fn parse_literal(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return json!(f);
        }
    }
    Value::String(text.to_string())
}

/// Assembles the value of a range reference from its member cells' values,
/// in row-major order.
///
/// - a single cell yields that cell's value
/// - a single row or column yields a flat array
/// - a 2-D span yields a table keyed by column name
pub fn range_value(rows: Vec<Vec<Value>>, col_names: &[String]) -> Value {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, |r| r.len());

    if n_rows == 1 && n_cols == 1 {
        let mut rows = rows;
        return rows.remove(0).remove(0);
    }
    if n_rows == 1 {
        let mut rows = rows;
        return Value::Array(rows.remove(0));
    }
    if n_cols == 1 {
        return Value::Array(rows.into_iter().map(|mut r| r.remove(0)).collect());
    }

    let mut data = Map::new();
    for col in 0..n_cols {
        let name = col_names
            .get(col)
            .cloned()
            .unwrap_or_else(|| crate::symbol::col_letters(col));
        let column: Vec<Value> = rows.iter().map(|r| r[col].clone()).collect();
        data.insert(name, Value::Array(column));
    }
    json!({
        "type": "table",
        "data": data,
        "columns": n_cols,
        "rows": n_rows,
    })
}
