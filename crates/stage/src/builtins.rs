//! The stages shipped with this crate.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Row as MysqlRow, Value as MysqlValue};
use row::IntermediateRow;
use serde_json::Value;

use crate::{Error, Stage, StageContext};

fn param<'a>(params: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn require_str<'a>(stage: &str, params: &'a [(String, Value)], name: &str) -> Result<&'a str, Error> {
    param(params, name)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidParam {
            stage: stage.to_string(),
            param: name.to_string(),
            reason: "expected a string".to_string(),
        })
}

/// Passes the row through unchanged. The identity stage; useful as a
/// single-entry pipeline for projections that need no enrichment.
pub struct NoOp;

#[async_trait]
impl Stage for NoOp {
    async fn run(
        &self,
        row: &IntermediateRow,
        _params: &[(String, Value)],
        _ctx: &StageContext<'_>,
    ) -> Result<Vec<IntermediateRow>, Error> {
        Ok(vec![row.clone()])
    }
}

/// Adds or overwrites a field on the row from a configured constant.
/// Parameters are `{ "field": <name>, "value": <json value> }`.
pub struct SetField;

#[async_trait]
impl Stage for SetField {
    async fn run(
        &self,
        row: &IntermediateRow,
        params: &[(String, Value)],
        _ctx: &StageContext<'_>,
    ) -> Result<Vec<IntermediateRow>, Error> {
        let field = require_str("set_field", params, "field")?;
        let value = param(params, "value").cloned().unwrap_or(Value::Null);

        let mut out = row.clone();
        let _ = out.insert(field.to_string(), value);
        Ok(vec![out])
    }
}

/// Fans a row out into one copy per element of a configured list-valued
/// field, each copy tagged with its element under `as` and a derived `id`
/// suffix (`<original id>-<index>`).
/// Parameters are `{ "field": <list field name>, "as": <output field name> }`.
pub struct ExpandList;

#[async_trait]
impl Stage for ExpandList {
    async fn run(
        &self,
        row: &IntermediateRow,
        params: &[(String, Value)],
        _ctx: &StageContext<'_>,
    ) -> Result<Vec<IntermediateRow>, Error> {
        let field = require_str("expand_list", params, "field")?;
        let as_field = require_str("expand_list", params, "as")?;

        let elements = match row.get(field) {
            Some(Value::Array(elements)) => elements.clone(),
            Some(_) | None => {
                return Err(Error::InvalidParam {
                    stage: "expand_list".to_string(),
                    param: "field".to_string(),
                    reason: format!("row has no list-valued field `{field}`"),
                })
            }
        };

        let base_id = row.get("id").and_then(Value::as_str).unwrap_or("").to_string();

        let mut out = Vec::with_capacity(elements.len());
        for (index, element) in elements.into_iter().enumerate() {
            let mut copy = row.clone();
            let _ = copy.insert(as_field.to_string(), element);
            let _ = copy.insert("id".to_string(), Value::String(format!("{base_id}-{index}")));
            out.push(copy);
        }

        Ok(out)
    }
}

/// Read-only enrichment: runs a parameterized `SELECT *` against the row's
/// schema pool, keyed by a configured column of the row, and merges the
/// first matched record's columns into the row under a configured prefix.
/// If no row matches, the input row passes through unchanged — stages must
/// tolerate a vanished join target rather than failing the whole event.
/// Parameters are `{ "table": <name>, "key_column": <db column>, "row_field": <row field
/// whose value is the lookup key>, "prefix": <prefix applied to merged columns> }`.
pub struct SqlLookup;

#[async_trait]
impl Stage for SqlLookup {
    async fn run(
        &self,
        row: &IntermediateRow,
        params: &[(String, Value)],
        ctx: &StageContext<'_>,
    ) -> Result<Vec<IntermediateRow>, Error> {
        let table = require_str("sql_lookup", params, "table")?;
        let key_column = require_str("sql_lookup", params, "key_column")?;
        let row_field = require_str("sql_lookup", params, "row_field")?;
        let prefix = param(params, "prefix").and_then(Value::as_str).unwrap_or("");

        let lookup_value = row.get(row_field).cloned().unwrap_or(Value::Null);
        let mysql_value = json_to_mysql_value(&lookup_value);

        let mut out = row.clone();

        if let Some(pool) = ctx.sql_pool.get(ctx.schema) {
            let mut conn = pool.get_conn().await.map_err(|source| Error::Sql {
                stage: "sql_lookup".to_string(),
                source: sql::Error::Pool {
                    schema: ctx.schema.to_string(),
                    source,
                },
            })?;

            let query = format!("SELECT * FROM {table} WHERE {key_column} = ? LIMIT 1");
            let found: Option<MysqlRow> =
                conn.exec_first(query, (mysql_value,)).await.map_err(|source| Error::Sql {
                    stage: "sql_lookup".to_string(),
                    source: sql::Error::Probe {
                        schema: ctx.schema.to_string(),
                        source,
                    },
                })?;

            if let Some(record) = found {
                for column in record.columns_ref() {
                    let name = column.name_str().to_string();
                    let value: MysqlValue = record.get(name.as_str()).unwrap_or(MysqlValue::NULL);
                    let _ = out.insert(format!("{prefix}{name}"), mysql_to_json_value(&value));
                }
            }
        }

        Ok(vec![out])
    }
}

fn json_to_mysql_value(value: &Value) -> MysqlValue {
    match value {
        Value::Null => MysqlValue::NULL,
        Value::Bool(b) => MysqlValue::Int(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MysqlValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MysqlValue::UInt(u)
            } else {
                MysqlValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => MysqlValue::Bytes(s.clone().into_bytes()),
        other => MysqlValue::Bytes(other.to_string().into_bytes()),
    }
}

fn mysql_to_json_value(value: &MysqlValue) -> Value {
    match value {
        MysqlValue::NULL => Value::Null,
        MysqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Null,
        },
        MysqlValue::Int(i) => Value::Number((*i).into()),
        MysqlValue::UInt(u) => Value::Number((*u).into()),
        MysqlValue::Float(f) => serde_json::Number::from_f64(*f as f64).map(Value::Number).unwrap_or(Value::Null),
        MysqlValue::Double(d) => serde_json::Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(fields: Value) -> IntermediateRow {
        fields.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn noop_passes_row_through() {
        let r = row(json!({"id": "1", "status": "new"}));
        let ctx = StageContext {
            schema: "shop",
            sql_pool: &unused_pool(),
        };
        let out = NoOp.run(&r, &[], &ctx).await.unwrap();
        assert_eq!(out, vec![r]);
    }

    #[tokio::test]
    async fn set_field_adds_constant() {
        let r = row(json!({"id": "1"}));
        let ctx = StageContext {
            schema: "shop",
            sql_pool: &unused_pool(),
        };
        let params = vec![("field".to_string(), json!("flag")), ("value".to_string(), json!(true))];
        let out = SetField.run(&r, &params, &ctx).await.unwrap();
        assert_eq!(out[0].get("flag"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn expand_list_fans_out_with_derived_ids() {
        let r = row(json!({"id": "7", "tags": ["a", "b"]}));
        let ctx = StageContext {
            schema: "shop",
            sql_pool: &unused_pool(),
        };
        let params = vec![("field".to_string(), json!("tags")), ("as".to_string(), json!("tag"))];
        let out = ExpandList.run(&r, &params, &ctx).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("id"), Some(&Value::String("7-0".into())));
        assert_eq!(out[0].get("tag"), Some(&Value::String("a".into())));
        assert_eq!(out[1].get("id"), Some(&Value::String("7-1".into())));
    }

    #[tokio::test]
    async fn expand_list_errors_when_field_is_not_a_list() {
        let r = row(json!({"id": "7", "tags": "not-a-list"}));
        let ctx = StageContext {
            schema: "shop",
            sql_pool: &unused_pool(),
        };
        let params = vec![("field".to_string(), json!("tags")), ("as".to_string(), json!("tag"))];
        assert!(ExpandList.run(&r, &params, &ctx).await.is_err());
    }

    fn unused_pool() -> sql::SqlPool {
        sql::SqlPool::empty()
    }
}
