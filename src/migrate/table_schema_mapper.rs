use crate::common::helpers::format_snake_case;
use crate::common::schema::{ColumnSpec, SourceColumn, TableSpec};
use crate::error::SchemaError;
use crate::mappings::Mappings;
use crate::migrate::migration_options::TableOptions;

pub struct TableSchemaMapper;

impl TableSchemaMapper {
    /// Maps the source description of `table` to the column layout of the target.
    ///
    /// The result depends only on the arguments, so mapping the same table twice
    /// always yields the same spec.
    pub fn map_schema(
        mappings: &Mappings,
        table: &str,
        columns: &[SourceColumn],
        options: &TableOptions,
        format: bool,
    ) -> Result<TableSpec, SchemaError> {
        let exists = |name: &str| columns.iter().any(|column| column.column_name == name);

        if let Some(unknown) = options.drop_columns.iter().find(|name| !exists(name)) {
            return Err(SchemaError::UnknownColumn {
                table: table.to_string(),
                column: unknown.clone(),
            });
        }

        let key = key_column(table, columns, options)?;

        if options.drop_columns.contains(&key) {
            return Err(SchemaError::DroppedKey {
                table: table.to_string(),
                column: key,
            });
        }

        let mut specs = Vec::with_capacity(columns.len());
        let mut key_index = 0;

        for column in columns {
            if options.drop_columns.contains(&column.column_name) {
                continue;
            }

            let mapping =
                mappings
                    .get(&column.data_type)
                    .ok_or_else(|| SchemaError::UnsupportedType {
                        table: table.to_string(),
                        column: column.column_name.clone(),
                        data_type: column.data_type.clone(),
                    })?;

            let is_key = column.column_name == key;
            if is_key {
                key_index = specs.len();
            }

            // The sorting key of the target table cannot be nullable.
            let is_nullable = column.is_nullable && !is_key;
            let data_type = mapping.target_type(column.numeric_precision, column.numeric_scale);
            let target_type = if is_nullable {
                format!("Nullable({})", data_type)
            } else {
                data_type
            };

            let target_name = if format {
                format_snake_case(&column.column_name)
            } else {
                column.column_name.clone()
            };

            specs.push(ColumnSpec {
                name: column.column_name.clone(),
                target_name,
                source_type: column.data_type.clone(),
                target_type,
                is_nullable,
                default: column.default.clone(),
                coercion: mapping.coercion,
            });
        }

        let target_name = if format {
            format_snake_case(table)
        } else {
            table.to_string()
        };

        Ok(TableSpec {
            name: table.to_string(),
            target_name,
            columns: specs,
            key_index,
            dropped: options.drop_columns.clone(),
        })
    }
}

fn key_column(
    table: &str,
    columns: &[SourceColumn],
    options: &TableOptions,
) -> Result<String, SchemaError> {
    if let Some(key) = &options.key {
        return if columns.iter().any(|column| &column.column_name == key) {
            Ok(key.clone())
        } else {
            Err(SchemaError::UnknownColumn {
                table: table.to_string(),
                column: key.clone(),
            })
        };
    }

    let primary: Vec<&SourceColumn> = columns.iter().filter(|c| c.is_primary_key).collect();
    match primary.as_slice() {
        [single] => Ok(single.column_name.clone()),
        _ => Err(SchemaError::MissingKey {
            table: table.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappings::Coercion;

    fn users() -> Vec<SourceColumn> {
        vec![
            SourceColumn::new("id", "uuid").primary_key(),
            SourceColumn::new("name", "text"),
            SourceColumn::new("email", "text").not_null(),
            SourceColumn::new("createdAt", "timestamp with time zone"),
        ]
    }

    #[test]
    fn users_table_maps_to_clickhouse_types() {
        let spec = TableSchemaMapper::map_schema(
            &Mappings::builtin(),
            "users",
            &users(),
            &TableOptions::default(),
            false,
        )
        .unwrap();

        let types: Vec<&str> = spec.columns.iter().map(|c| c.target_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "FixedString(36)",
                "Nullable(String)",
                "String",
                "Nullable(DateTime64(6, 'UTC'))"
            ]
        );
        assert_eq!(spec.key_column().name, "id");
        assert_eq!(spec.key_column().coercion, Coercion::UuidToString);
    }

    #[test]
    fn mapping_is_deterministic() {
        let mappings = Mappings::builtin();
        let options = TableOptions::default();

        let first = TableSchemaMapper::map_schema(&mappings, "users", &users(), &options, true);
        let second = TableSchemaMapper::map_schema(&mappings, "users", &users(), &options, true);

        assert_eq!(first, second);
        assert_eq!(first.unwrap().columns[3].target_name, "created_at");
    }

    #[test]
    fn unsupported_type_names_the_column() {
        let mut columns = users();
        columns.push(SourceColumn::new("location", "geometry"));

        let err = TableSchemaMapper::map_schema(
            &Mappings::builtin(),
            "users",
            &columns,
            &TableOptions::default(),
            false,
        )
        .unwrap_err();

        assert_eq!(
            err,
            SchemaError::UnsupportedType {
                table: "users".into(),
                column: "location".into(),
                data_type: "geometry".into(),
            }
        );
    }

    #[test]
    fn dropped_columns_skip_mapping() {
        let mut columns = users();
        columns.push(SourceColumn::new("location", "geometry"));
        let options = TableOptions {
            drop_columns: vec!["location".into()],
            key: None,
        };

        let spec =
            TableSchemaMapper::map_schema(&Mappings::builtin(), "users", &columns, &options, false)
                .unwrap();

        assert_eq!(spec.columns.len(), 4);
        assert_eq!(spec.dropped, vec!["location".to_string()]);
    }

    #[test]
    fn key_rules() {
        let mappings = Mappings::builtin();
        let keyless = vec![
            SourceColumn::new("a", "integer"),
            SourceColumn::new("b", "text"),
        ];

        let err =
            TableSchemaMapper::map_schema(&mappings, "log", &keyless, &TableOptions::default(), false)
                .unwrap_err();
        assert_eq!(err, SchemaError::MissingKey { table: "log".into() });

        let by_override = TableOptions {
            drop_columns: vec![],
            key: Some("a".into()),
        };
        let spec =
            TableSchemaMapper::map_schema(&mappings, "log", &keyless, &by_override, false).unwrap();
        assert_eq!(spec.key_index, 0);
        assert_eq!(spec.key_column().target_type, "Int32");

        let dropping_key = TableOptions {
            drop_columns: vec!["id".into()],
            key: None,
        };
        let err =
            TableSchemaMapper::map_schema(&mappings, "users", &users(), &dropping_key, false)
                .unwrap_err();
        assert!(matches!(err, SchemaError::DroppedKey { .. }));
    }
}
