use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use uuid::Uuid;

use crate::common::value::{Value, ValueKind};

const DEFAULT_DECIMAL_PRECISION: u32 = 38;
const DEFAULT_DECIMAL_SCALE: u32 = 10;

#[derive(Debug, Clone)]
pub struct Mappings {
    mappings: HashMap<String, Mapping>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub to_type: String,
    pub coercion: Coercion,
    pub type_parameters: bool,
}

/// How a source value becomes a value the target column accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Bool,
    Integer,
    Float,
    Decimal,
    Text,
    UuidToString,
    Date,
    Timestamp,
    TimestampTz,
    JsonToString,
    BytesToHex,
}

impl Coercion {
    /// Kind the source driver decodes values of this column into.
    pub fn input_kind(self) -> ValueKind {
        match self {
            Coercion::Bool => ValueKind::Bool,
            Coercion::Integer => ValueKind::Int,
            Coercion::Float => ValueKind::Float,
            Coercion::Decimal => ValueKind::Decimal,
            Coercion::Text => ValueKind::Text,
            Coercion::UuidToString => ValueKind::Uuid,
            Coercion::Date => ValueKind::Date,
            Coercion::Timestamp => ValueKind::Timestamp,
            Coercion::TimestampTz => ValueKind::TimestampTz,
            Coercion::JsonToString => ValueKind::Json,
            Coercion::BytesToHex => ValueKind::Bytes,
        }
    }

    /// Kind of the coerced value, which is also how the target hands it back.
    pub fn output_kind(self) -> ValueKind {
        match self {
            Coercion::UuidToString | Coercion::JsonToString | Coercion::BytesToHex => {
                ValueKind::Text
            }
            other => other.input_kind(),
        }
    }

    pub fn apply(self, value: Value, nullable: bool) -> Result<Value, String> {
        if value.is_null() {
            return if nullable {
                Ok(Value::Null)
            } else {
                Err("NULL in non-nullable column".to_string())
            };
        }

        match (self, value) {
            (Coercion::UuidToString, Value::Uuid(uuid)) => Ok(Value::Text(uuid_string(&uuid))),
            (Coercion::UuidToString, Value::Text(text)) => Uuid::parse_str(&text)
                .map(|uuid| Value::Text(uuid_string(&uuid)))
                .map_err(|_| format!("'{}' is not a uuid", text)),
            (Coercion::JsonToString, Value::Json(json)) => Ok(Value::Text(json)),
            (Coercion::BytesToHex, Value::Bytes(bytes)) => Ok(Value::Text(hex::encode(bytes))),
            (Coercion::Text, Value::Uuid(uuid)) => Ok(Value::Text(uuid_string(&uuid))),
            (coercion, value) => coercion.output_kind().conform(value),
        }
    }
}

fn uuid_string(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}

impl FromStr for Coercion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let coercion = match s {
            "bool" => Coercion::Bool,
            "integer" => Coercion::Integer,
            "float" => Coercion::Float,
            "decimal" => Coercion::Decimal,
            "text" => Coercion::Text,
            "uuid_to_string" => Coercion::UuidToString,
            "date" => Coercion::Date,
            "timestamp" => Coercion::Timestamp,
            "timestamptz" => Coercion::TimestampTz,
            "json_to_string" => Coercion::JsonToString,
            "bytes_to_hex" => Coercion::BytesToHex,
            other => bail!("Unknown coercion '{}'", other),
        };
        Ok(coercion)
    }
}

impl Mapping {
    fn new(to_type: &str, coercion: Coercion) -> Self {
        Mapping {
            to_type: to_type.to_string(),
            coercion,
            type_parameters: false,
        }
    }

    /// Renders the target type, filling in precision and scale where the type takes them.
    pub fn target_type(&self, precision: Option<u32>, scale: Option<u32>) -> String {
        if !self.type_parameters {
            return self.to_type.clone();
        }

        let precision = precision
            .filter(|value| (1..=76).contains(value))
            .unwrap_or(DEFAULT_DECIMAL_PRECISION);
        let scale = scale
            .filter(|value| *value <= precision)
            .unwrap_or(DEFAULT_DECIMAL_SCALE.min(precision));

        format!("{}({}, {})", self.to_type, precision, scale)
    }
}

impl Mappings {
    /// Row-store to column-store mappings every run starts from.
    pub fn builtin() -> Self {
        let mut mappings = HashMap::new();

        let mut add = |types: &[&str], mapping: Mapping| {
            for from_type in types {
                mappings.insert(from_type.to_string(), mapping.clone());
            }
        };

        add(&["smallint", "int2"], Mapping::new("Int16", Coercion::Integer));
        add(
            &["integer", "int", "int4", "serial", "serial4"],
            Mapping::new("Int32", Coercion::Integer),
        );
        add(
            &["bigint", "int8", "bigserial", "serial8"],
            Mapping::new("Int64", Coercion::Integer),
        );
        add(
            &["real", "float4", "double precision", "float8"],
            Mapping::new("Float64", Coercion::Float),
        );
        add(
            &["numeric", "decimal"],
            Mapping {
                type_parameters: true,
                ..Mapping::new("Decimal", Coercion::Decimal)
            },
        );
        add(&["boolean", "bool"], Mapping::new("Bool", Coercion::Bool));
        add(
            &[
                "text",
                "varchar",
                "character varying",
                "character",
                "char",
                "bpchar",
                "name",
                "citext",
            ],
            Mapping::new("String", Coercion::Text),
        );
        add(&["uuid"], Mapping::new("FixedString(36)", Coercion::UuidToString));
        add(
            &["timestamp", "timestamp without time zone"],
            Mapping::new("DateTime64(6)", Coercion::Timestamp),
        );
        add(
            &["timestamptz", "timestamp with time zone"],
            Mapping::new("DateTime64(6, 'UTC')", Coercion::TimestampTz),
        );
        add(&["date"], Mapping::new("Date32", Coercion::Date));
        add(&["json", "jsonb"], Mapping::new("String", Coercion::JsonToString));
        add(&["bytea"], Mapping::new("String", Coercion::BytesToHex));

        Mappings { mappings }
    }

    pub fn get(&self, name: &str) -> Option<&Mapping> {
        self.mappings.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Layers the entries of a `mappings.toml` document over these mappings.
    pub(crate) fn merge_toml(mut self, value: toml::Value) -> Result<Mappings> {
        let mappings_table = value
            .get("mappings")
            .ok_or_else(|| anyhow!("Missing mappings table"))?
            .as_array()
            .ok_or_else(|| anyhow!("Invalid mappings table format"))?;

        for mapping_table in mappings_table {
            let mapping_table = mapping_table
                .as_table()
                .ok_or_else(|| anyhow!("Invalid mapping format"))?;
            let from_type = mapping_table
                .get("from_type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Missing or invalid 'from_type' field"))?
                .to_lowercase();
            let to_type = mapping_table
                .get("to_type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Missing or invalid 'to_type' field"))?
                .to_string();
            let coercion = mapping_table
                .get("coercion")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("Missing or invalid 'coercion' field"))?
                .parse::<Coercion>()?;
            let type_parameters = mapping_table
                .get("type_parameters")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);

            let mapping = Mapping {
                to_type,
                coercion,
                type_parameters,
            };

            self.mappings.insert(from_type, mapping);
        }

        Ok(self)
    }
}
