//! DC-012: Record codecs for sync: CSV, JSON, YAML and SQL `INSERT` batches.

use crate::core::error::{Error, Result};
use crate::core::types::Engine;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// One row: column name to value, in column order.
pub type Record = Map<String, Value>;

/// Decode every record of a file datasource.
pub fn decode(engine: Engine, text: &str) -> Result<Vec<Record>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    match engine {
        Engine::Json => serde_json::from_str(text).map_err(|e| Error::codec(format!("json: {}", e))),
        Engine::Yaml => {
            serde_yaml_ng::from_str(text).map_err(|e| Error::codec(format!("yaml: {}", e)))
        }
        Engine::Csv => decode_csv(text),
        Engine::Mysql | Engine::Postgres => Err(Error::codec(format!(
            "{} is not a file format",
            engine
        ))),
    }
}

fn decode_csv(text: &str) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::codec(format!("csv header: {}", e)))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| Error::codec(format!("csv: {}", e)))?;
        let mut record = Record::new();
        for (column, field) in headers.iter().zip(row.iter()) {
            let value = if field.is_empty() {
                Value::Null
            } else {
                Value::String(field.to_string())
            };
            record.insert(column.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

/// Encode records in a file engine's format.
pub fn encode(engine: Engine, records: &[Record]) -> Result<String> {
    match engine {
        Engine::Json => serde_json::to_string_pretty(records)
            .map(|s| s + "\n")
            .map_err(|e| Error::codec(format!("json: {}", e))),
        Engine::Yaml => {
            serde_yaml_ng::to_string(records).map_err(|e| Error::codec(format!("yaml: {}", e)))
        }
        Engine::Csv => encode_csv(records),
        Engine::Mysql | Engine::Postgres => Err(Error::codec(format!(
            "{} is not a file format",
            engine
        ))),
    }
}

fn encode_csv(records: &[Record]) -> Result<String> {
    let columns = columns(records);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .map_err(|e| Error::codec(format!("csv: {}", e)))?;
    for record in records {
        let row: Vec<String> = columns
            .iter()
            .map(|c| record.get(c).map(plain_text).unwrap_or_default())
            .collect();
        writer
            .write_record(&row)
            .map_err(|e| Error::codec(format!("csv: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::codec(format!("csv: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::codec(format!("csv: {}", e)))
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Union of the records' columns, first-seen order.
pub fn columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Plain identifier, optionally schema-qualified.
static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier pattern is valid")
});

/// Accept plain (optionally schema-qualified) SQL identifiers only.
pub fn check_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(name)
    } else {
        Err(Error::codec(format!("invalid SQL identifier '{}'", name)))
    }
}

/// Render a value as a SQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

/// Single-quote a string, doubling embedded quotes.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// One multi-row `INSERT` for a batch. Missing columns insert `NULL`.
pub fn insert_statement(table: &str, columns: &[String], batch: &[Record]) -> Result<String> {
    check_identifier(table)?;
    for c in columns {
        check_identifier(c)?;
    }
    if columns.is_empty() || batch.is_empty() {
        return Err(Error::codec(format!("nothing to insert into {}", table)));
    }

    let rows: Vec<String> = batch
        .iter()
        .map(|record| {
            let values: Vec<String> = columns
                .iter()
                .map(|c| record.get(c).map(sql_literal).unwrap_or_else(|| "NULL".to_string()))
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();

    Ok(format!(
        "INSERT INTO {} ({}) VALUES {};",
        table,
        columns.join(", "),
        rows.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_dc012_decode_csv() {
        let records = decode(Engine::Csv, "id,name,nick\n1,Ada,\n2,\"Lin, B\",lb\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], json!("Ada"));
        assert_eq!(records[0]["nick"], Value::Null);
        assert_eq!(records[1]["name"], json!("Lin, B"));
    }

    #[test]
    fn test_dc012_decode_json_and_yaml_agree() {
        let from_json = decode(Engine::Json, r#"[{"id": 1, "name": "Ada"}]"#).unwrap();
        let from_yaml = decode(Engine::Yaml, "- id: 1\n  name: Ada\n").unwrap();
        assert_eq!(from_json, from_yaml);
    }

    #[test]
    fn test_dc012_decode_empty_and_errors() {
        assert!(decode(Engine::Json, "  \n").unwrap().is_empty());
        assert!(decode(Engine::Json, "{not json").is_err());
        assert!(decode(Engine::Json, r#"{"id": 1}"#).is_err(), "top level must be a list");
        assert!(decode(Engine::Mysql, "x").is_err());
    }

    #[test]
    fn test_dc012_encode_csv_union_columns() {
        let records = vec![
            rec(json!({"id": 1, "name": "Ada"})),
            rec(json!({"id": 2, "email": "b@x.io"})),
        ];
        let out = encode(Engine::Csv, &records).unwrap();
        assert_eq!(out, "id,name,email\n1,Ada,\n2,,b@x.io\n");
    }

    #[test]
    fn test_dc012_encode_json_yaml() {
        let records = vec![rec(json!({"id": 1}))];
        let json_out = encode(Engine::Json, &records).unwrap();
        assert!(json_out.ends_with('\n'));
        assert_eq!(decode(Engine::Json, &json_out).unwrap(), records);
        let yaml_out = encode(Engine::Yaml, &records).unwrap();
        assert!(yaml_out.contains("id: 1"));
    }

    #[test]
    fn test_dc012_sql_literals() {
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&json!(true)), "TRUE");
        assert_eq!(sql_literal(&json!(42)), "42");
        assert_eq!(sql_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(sql_literal(&json!({"a": 1})), r#"'{"a":1}'"#);
    }

    #[test]
    fn test_dc012_insert_statement() {
        let batch = vec![
            rec(json!({"id": 1, "name": "Ada"})),
            rec(json!({"id": 2})),
        ];
        let cols = columns(&batch);
        let sql = insert_statement("public.users", &cols, &batch).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO public.users (id, name) VALUES (1, 'Ada'), (2, NULL);"
        );
    }

    #[test]
    fn test_dc012_insert_rejects_bad_identifiers() {
        let batch = vec![rec(json!({"id": 1}))];
        assert!(insert_statement("users; DROP TABLE x", &["id".into()], &batch).is_err());
        assert!(insert_statement("users", &["i d".into()], &batch).is_err());
        assert!(insert_statement("users", &[], &batch).is_err());
    }
}
