use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single field value moving between the two stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact decimal in its textual form.
    Decimal(String),
    Text(String),
    Uuid(Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(String),
    Bytes(Vec<u8>),
}

pub type Row = Vec<Value>;

/// Kind a column's values are expected to have after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Uuid,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Bytes,
}

/// Column name paired with the kind its decoded values must conform to.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub name: String,
    pub kind: ValueKind,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        ColumnRef {
            name: name.into(),
            kind,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Uuid(_) => "uuid",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Json(_) => "json",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Orders two key values. Only values of the same variant are comparable.
    pub fn compare_key(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::TimestampTz(a), Value::TimestampTz(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => compare_decimals(a, b),
            _ => None,
        }
    }

    /// Field equality that ignores representation noise such as trailing decimal zeros.
    pub fn same_as(&self, other: &Value) -> bool {
        self.canonical_text() == other.canonical_text()
    }

    /// Stable textual form used for checksums and comparisons.
    pub fn canonical_text(&self) -> String {
        match self {
            Value::Null => "\\N".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Decimal(v) => normalize_decimal(v),
            Value::Text(v) | Value::Json(v) => v.clone(),
            Value::Uuid(v) => v.hyphenated().to_string(),
            Value::Date(v) => v.format(DATE_FORMAT).to_string(),
            Value::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
            Value::TimestampTz(v) => v.naive_utc().format(TIMESTAMP_FORMAT).to_string(),
            Value::Bytes(v) => hex::encode(v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            other => write!(f, "{}", other.canonical_text()),
        }
    }
}

impl ValueKind {
    /// Converts a loosely decoded value (as returned by a text or JSON protocol)
    /// into this kind.
    pub fn conform(self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let converted = match (self, value) {
            (ValueKind::Bool, Value::Bool(v)) => Value::Bool(v),
            (ValueKind::Bool, Value::Int(v)) if v == 0 || v == 1 => Value::Bool(v == 1),
            (ValueKind::Bool, Value::Text(v)) => match v.as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => return Err(format!("'{}' is not a boolean", v)),
            },

            (ValueKind::Int, Value::Int(v)) => Value::Int(v),
            (ValueKind::Int, Value::Float(v)) if v.fract() == 0.0 => Value::Int(v as i64),
            (ValueKind::Int, Value::Text(v)) | (ValueKind::Int, Value::Decimal(v)) => {
                Value::Int(v.parse().map_err(|_| format!("'{}' is not an integer", v))?)
            }

            (ValueKind::Float, Value::Float(v)) => Value::Float(v),
            (ValueKind::Float, Value::Int(v)) => Value::Float(v as f64),
            (ValueKind::Float, Value::Text(v)) | (ValueKind::Float, Value::Decimal(v)) => {
                Value::Float(v.parse().map_err(|_| format!("'{}' is not a float", v))?)
            }

            (ValueKind::Decimal, Value::Decimal(v)) => Value::Decimal(v),
            (ValueKind::Decimal, Value::Int(v)) => Value::Decimal(v.to_string()),
            (ValueKind::Decimal, Value::Float(v)) => Value::Decimal(v.to_string()),
            (ValueKind::Decimal, Value::Text(v)) => {
                v.parse::<f64>()
                    .map_err(|_| format!("'{}' is not a decimal", v))?;
                Value::Decimal(v)
            }

            (ValueKind::Text, Value::Text(v)) => Value::Text(v),
            (ValueKind::Text, Value::Json(v)) => Value::Text(v),
            (ValueKind::Json, Value::Json(v)) | (ValueKind::Json, Value::Text(v)) => {
                Value::Json(v)
            }

            (ValueKind::Uuid, Value::Uuid(v)) => Value::Uuid(v),
            (ValueKind::Uuid, Value::Text(v)) => Value::Uuid(
                Uuid::parse_str(&v).map_err(|_| format!("'{}' is not a uuid", v))?,
            ),

            (ValueKind::Date, Value::Date(v)) => Value::Date(v),
            (ValueKind::Date, Value::Text(v)) => Value::Date(
                NaiveDate::parse_from_str(&v, DATE_FORMAT)
                    .map_err(|_| format!("'{}' is not a date", v))?,
            ),

            (ValueKind::Timestamp, Value::Timestamp(v)) => Value::Timestamp(v),
            (ValueKind::Timestamp, Value::Text(v)) => Value::Timestamp(parse_timestamp(&v)?),
            (ValueKind::TimestampTz, Value::TimestampTz(v)) => Value::TimestampTz(v),
            (ValueKind::TimestampTz, Value::Timestamp(v)) => {
                Value::TimestampTz(DateTime::from_naive_utc_and_offset(v, Utc))
            }
            (ValueKind::TimestampTz, Value::Text(v)) => Value::TimestampTz(
                DateTime::from_naive_utc_and_offset(parse_timestamp(&v)?, Utc),
            ),

            (ValueKind::Bytes, Value::Bytes(v)) => Value::Bytes(v),
            (ValueKind::Bytes, Value::Text(v)) => Value::Bytes(
                hex::decode(v.trim_start_matches("\\x"))
                    .map_err(|_| format!("'{}' is not hex encoded", v))?,
            ),

            (kind, other) => {
                return Err(format!(
                    "cannot read {} value '{}' as {:?}",
                    other.type_name(),
                    other,
                    kind
                ))
            }
        };

        Ok(converted)
    }
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|_| format!("'{}' is not a timestamp", value))
}

/// Strips insignificant zeros so `12.3400` and `12.34` compare equal.
/// Exact ordering of two plain decimal strings such as `-12.50`.
/// `None` for anything else (exponents, `NaN`).
fn compare_decimals(a: &str, b: &str) -> Option<Ordering> {
    let (a_negative, a_int, a_frac) = decimal_parts(a)?;
    let (b_negative, b_int, b_frac) = decimal_parts(b)?;

    let magnitude = a_int
        .len()
        .cmp(&b_int.len())
        .then_with(|| a_int.cmp(b_int))
        .then_with(|| a_frac.cmp(b_frac));

    Some(match (a_negative, b_negative) {
        (false, false) => magnitude,
        (true, true) => magnitude.reverse(),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
    })
}

// Sign, integer digits without leading zeros, fraction digits without trailing zeros.
fn decimal_parts(value: &str) -> Option<(bool, &str, &str)> {
    let value = value.trim();
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

    let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !is_digits(int_part) || !is_digits(frac_part) {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    // -0 and 0 are the same key.
    let negative = negative && !(int_part.is_empty() && frac_part.is_empty());
    Some((negative, int_part, frac_part))
}

pub fn normalize_decimal(value: &str) -> String {
    let value = value.trim();
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", value),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part.trim_end_matches('0')),
        None => (digits, ""),
    };

    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        trimmed => trimmed,
    };

    let normalized = if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    };

    if normalized == "0" {
        normalized
    } else {
        format!("{}{}", sign, normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_decimal_keys_keep_their_order() {
        let key = |v: &str| Value::Decimal(v.into());

        // Both round to the same f64.
        assert_eq!(
            key("9007199254740993").compare_key(&key("9007199254740992")),
            Some(Ordering::Greater)
        );
        assert_eq!(
            key("12345678901234567890.000000001").compare_key(&key("12345678901234567890")),
            Some(Ordering::Greater)
        );
        assert_eq!(key("-2.5").compare_key(&key("-10")), Some(Ordering::Greater));
        assert_eq!(key("-0.0").compare_key(&key("0")), Some(Ordering::Equal));
        assert_eq!(key("007.10").compare_key(&key("7.1")), Some(Ordering::Equal));
        assert_eq!(key("0.05").compare_key(&key("0.5")), Some(Ordering::Less));
        assert_eq!(key("NaN").compare_key(&key("1")), None);
    }

    #[test]
    fn decimals_compare_without_trailing_zeros() {
        assert_eq!(normalize_decimal("12.3400000000"), "12.34");
        assert_eq!(normalize_decimal("-0.500"), "-0.5");
        assert_eq!(normalize_decimal("007"), "7");
        assert_eq!(normalize_decimal("-0.000"), "0");
        assert!(Value::Decimal("1.10".into()).same_as(&Value::Decimal("1.1".into())));
    }

    #[test]
    fn keys_only_compare_within_a_variant() {
        assert_eq!(
            Value::Int(3).compare_key(&Value::Int(7)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(3).compare_key(&Value::Text("3".into())), None);
    }

    #[test]
    fn json_protocol_values_conform_to_column_kinds() {
        assert_eq!(
            ValueKind::Int.conform(Value::Text("9007199254740993".into())),
            Ok(Value::Int(9007199254740993))
        );
        assert_eq!(
            ValueKind::Timestamp.conform(Value::Text("2024-03-01 10:15:00.250000".into())),
            Ok(Value::Timestamp(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_micro_opt(10, 15, 0, 250_000)
                    .unwrap()
            ))
        );
        assert_eq!(ValueKind::Text.conform(Value::Null), Ok(Value::Null));
        assert!(ValueKind::Uuid.conform(Value::Text("not-a-uuid".into())).is_err());
    }

    #[test]
    fn watermark_survives_serialization() {
        let key = Value::Uuid(Uuid::parse_str("6f1d7a52-8b7e-4c0e-9b44-1d2f7c0e5a11").unwrap());
        let encoded = serde_json::to_string(&key).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, key);
    }
}
