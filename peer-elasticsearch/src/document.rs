use anyhow::Context;
use peer_core::{CdcError, Record, Table};
use value::{TypeError, TypeMap, Value};

/// Index names must be lowercase.
pub fn index_name(table: &str) -> String {
    table.to_lowercase()
}

/// JSON columns are indexed as objects rather than strings.
pub fn decode_json_document(v: Value) -> Result<Value, TypeError> {
    match v {
        Value::Text(s) => match serde_json::from_str(&s) {
            Ok(json) => Ok(Value::Json(json)),
            Err(_) => Ok(Value::Text(s)),
        },
        _ => Ok(v),
    }
}

/// Primary key values joined with `:`.
pub fn document_id(record: &Record, keys: &[&str], type_map: &TypeMap) -> anyhow::Result<String> {
    if keys.is_empty() {
        return Err(CdcError::configuration("documents need a primary key").into());
    }
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let data = record
            .value(key)
            .ok_or_else(|| CdcError::data(format!("record has no value for key {}", key)))?;
        let v = type_map
            .decode(data)
            .with_context(|| format!("field {} decode fail", key))?;
        parts.push(v.to_plain_string());
    }
    Ok(parts.join(":"))
}

pub fn document(
    record: &Record,
    type_map: &TypeMap,
) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let mut doc = serde_json::Map::with_capacity(record.fields.len());
    for field in &record.fields {
        let v = type_map
            .decode(&field.value)
            .with_context(|| format!("field {} decode fail", field.name))?;
        doc.insert(field.name.clone(), v.to_serde_json_value());
    }
    Ok(doc)
}

/// Newline delimited `_bulk` payload indexing every record of `table`.
pub fn bulk_body(table: &Table, records: &[Record], type_map: &TypeMap) -> anyhow::Result<String> {
    let keys = table.primary_key_names();
    let index = index_name(&table.name);
    let mut body = String::new();
    for record in records {
        let action = serde_json::json!({
            "index": { "_index": index, "_id": document_id(record, &keys, type_map)? }
        });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&serde_json::Value::Object(document(record, type_map)?).to_string());
        body.push('\n');
    }
    Ok(body)
}

/// First item error of a `_bulk` response, if the response reports any.
pub fn bulk_failure(response: &serde_json::Value) -> Option<String> {
    let failed = response
        .get("errors")
        .and_then(|e| e.as_bool())
        .unwrap_or(false);
    if !failed {
        return None;
    }
    let first = response
        .get("items")
        .and_then(|items| items.as_array())
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.as_object()?.values().next()?.get("error").cloned())
        });
    Some(
        first
            .map(|e| e.to_string())
            .unwrap_or_else(|| "bulk request reported errors".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use peer_core::{Column, Field};
    use value::{Type, TypedData};

    use super::*;

    fn lines() -> Table {
        Table::new(
            "OrderLines",
            vec![
                Column::new("order_id", Type::Int).primary_key(),
                Column::new("line", Type::Int).primary_key(),
                Column::new("payload", Type::Blob),
            ],
        )
    }

    fn line(order: i64, n: i64) -> Record {
        Record::new(vec![
            Field::new("order_id", TypedData::new(Type::Int, Value::Int(order))),
            Field::new("line", TypedData::new(Type::Int, Value::Int(n))),
            Field::new("payload", TypedData::new(Type::Blob, Value::bytes(vec![0u8, 1]))),
        ])
    }

    #[test]
    fn ids_join_every_key() {
        let types = TypeMap::with_defaults();
        assert_eq!(document_id(&line(7, 2), &["order_id", "line"], &types).unwrap(), "7:2");

        let err = document_id(&line(7, 2), &["sku"], &types).unwrap_err();
        assert!(matches!(
            peer_core::error::classify(&err),
            Some(CdcError::Data { .. })
        ));
        assert!(document_id(&line(7, 2), &[], &types).is_err());
    }

    #[test]
    fn bulk_lines_pair_actions_with_documents() {
        let types = TypeMap::with_defaults();
        let body = bulk_body(&lines(), &[line(1, 1), line(1, 2)], &types).unwrap();
        let rows: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(
            rows[0],
            serde_json::json!({"index": {"_index": "orderlines", "_id": "1:1"}})
        );
        assert_eq!(
            rows[1],
            serde_json::json!({"order_id": 1, "line": 1, "payload": "AAE="})
        );
        assert_eq!(rows[2]["index"]["_id"], "1:2");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_errors_surface_the_first_reason() {
        let ok = serde_json::json!({"errors": false, "items": []});
        assert_eq!(bulk_failure(&ok), None);

        let failed = serde_json::json!({
            "errors": true,
            "items": [
                {"index": {"_id": "1", "status": 201}},
                {"index": {"_id": "2", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        });
        let reason = bulk_failure(&failed).unwrap();
        assert!(reason.contains("mapper_parsing_exception"));

        let bare = serde_json::json!({"errors": true});
        assert!(bulk_failure(&bare).is_some());
    }

    #[test]
    fn plain_text_is_not_forced_into_json() {
        assert_eq!(
            decode_json_document(Value::text("not json")).unwrap(),
            Value::text("not json")
        );
        assert_eq!(
            decode_json_document(Value::text("[1]")).unwrap(),
            Value::Json(serde_json::json!([1]))
        );
    }
}
