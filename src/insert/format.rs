use serde_json::json;

use crate::common::value::{Value, DATE_FORMAT, TIMESTAMP_FORMAT};

/// Renders a value as a ClickHouse SQL literal.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(val) => val.to_string(),
        Value::Int(val) => format_number_value(val),
        Value::Float(val) => format_number_value(val),
        Value::Decimal(val) => format_string_value(val),
        Value::Text(val) | Value::Json(val) => format_string_value(val),
        Value::Uuid(val) => format_string_value(val.hyphenated()),
        Value::Date(val) => format_string_value(val.format(DATE_FORMAT)),
        Value::Timestamp(val) => format_string_value(val.format(TIMESTAMP_FORMAT)),
        Value::TimestampTz(val) => {
            format_string_value(val.naive_utc().format(TIMESTAMP_FORMAT))
        }
        Value::Bytes(val) => format_string_value(hex::encode(val)),
    }
}

pub fn format_string_value<T: ToString>(value: T) -> String {
    let escaped = value
        .to_string()
        .replace('\\', "\\\\")
        .replace('\'', "\\'");
    format!("'{}'", escaped)
}

pub fn format_number_value<T>(value: &T) -> String
where
    T: std::fmt::Display,
{
    value.to_string()
}

/// Substitutes `?` placeholders with literals, left to right. A `?` inside
/// quotes or backticks belongs to a literal or an identifier and stays as is.
pub fn bind_literals(sql: &str, params: &[Value]) -> Result<String, String> {
    let mut bound = String::with_capacity(sql.len() + params.len() * 16);
    let mut placeholders = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in sql.chars() {
        match quote {
            Some(open) => {
                bound.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == open {
                    quote = None;
                }
            }
            None if matches!(c, '\'' | '"' | '`') => {
                quote = Some(c);
                bound.push(c);
            }
            None if c == '?' => {
                if let Some(param) = params.get(placeholders) {
                    bound.push_str(&format_value(param));
                }
                placeholders += 1;
            }
            None => bound.push(c),
        }
    }

    if placeholders != params.len() {
        return Err(format!(
            "statement has {} placeholders but {} parameters were given",
            placeholders,
            params.len()
        ));
    }
    Ok(bound)
}

/// Encodes a row as one `JSONCompactEachRow` line.
pub fn format_json_row(row: &[Value]) -> String {
    let values = row.iter().map(json_value).collect::<Vec<_>>();
    serde_json::Value::Array(values).to_string()
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(val) => json!(val),
        Value::Int(val) => json!(val),
        Value::Float(val) if val.is_finite() => json!(val),
        Value::Float(val) => json!(val.to_string()),
        Value::Decimal(val) | Value::Text(val) | Value::Json(val) => json!(val),
        Value::Uuid(val) => json!(val.hyphenated().to_string()),
        Value::Date(val) => json!(val.format(DATE_FORMAT).to_string()),
        Value::Timestamp(val) => json!(val.format(TIMESTAMP_FORMAT).to_string()),
        Value::TimestampTz(val) => json!(val.naive_utc().format(TIMESTAMP_FORMAT).to_string()),
        Value::Bytes(val) => json!(hex::encode(val)),
    }
}

/// Decodes one field of a `JSONCompact*` result row.
pub fn parse_json_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(val) => Value::Bool(val),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(val) => Value::Int(val),
            None if number.is_u64() => Value::Decimal(number.to_string()),
            None => Value::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(val) => Value::Text(val),
        other => Value::Json(other.to_string()),
    }
}
