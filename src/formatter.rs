//! Entity query formatting
//!
//! Turns a list of records into a rectangular table. The first record fixes
//! the header set; nested objects expand into dotted paths
//! (`BillAddr.City`), arrays stay unexpanded and render as JSON.

use crate::models::Table;
use serde_json::{Map, Value};

pub const NO_RECORDS: &str = "No records found";
const NO_RECORDS_HEADER: &str = "Result";

pub fn format_records(records: &[Value]) -> Table {
    let Some(first) = records.first() else {
        return Table {
            headers: vec![NO_RECORDS_HEADER.to_string()],
            rows: vec![vec![NO_RECORDS.to_string()]],
        };
    };

    let mut headers = Vec::new();
    match first {
        Value::Object(map) => collect_paths(map, "", &mut headers),
        _ => headers.push("value".to_string()),
    }

    let rows = records
        .iter()
        .map(|record| {
            headers
                .iter()
                .map(|path| match record {
                    Value::Object(_) => lookup(record, path).map(render).unwrap_or_default(),
                    scalar => render(scalar),
                })
                .collect()
        })
        .collect();

    Table { headers, rows }
}

fn collect_paths(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => collect_paths(inner, &path, out),
            _ => out.push(path),
        }
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |node, key| node.get(key))
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
