use crate::error::{DbError, DbResult};
use crate::io::{ByteReader, ByteWriter};
use crate::table::schema::{ColumnType, TableSchema};

/// A single column value inside a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Varchar(String),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in a column of `column_type`.
    /// `Null` is legal for any type; nullability is checked separately.
    pub fn matches_type(&self, column_type: &ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Integer(_), ColumnType::Integer)
                | (Value::BigInt(_), ColumnType::BigInt)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Varchar(_), ColumnType::Varchar(_))
                | (Value::Text(_), ColumnType::Text)
        )
    }

    /// Self-describing encoding, used for column defaults in the
    /// catalog. Records use the schema-driven format below instead.
    pub fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Value::Null => writer.write_u8(0),
            Value::Boolean(v) => {
                writer.write_u8(1);
                writer.write_bool(*v);
            }
            Value::Integer(v) => {
                writer.write_u8(2);
                writer.write_i32(*v);
            }
            Value::BigInt(v) => {
                writer.write_u8(3);
                writer.write_i64(*v);
            }
            Value::Float(v) => {
                writer.write_u8(4);
                writer.write_f32(*v);
            }
            Value::Double(v) => {
                writer.write_u8(5);
                writer.write_f64(*v);
            }
            Value::Varchar(v) => {
                writer.write_u8(6);
                writer.write_len_str(v);
            }
            Value::Text(v) => {
                writer.write_u8(7);
                writer.write_len_str(v);
            }
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> DbResult<Self> {
        match reader.read_u8()? {
            0 => Ok(Value::Null),
            1 => Ok(Value::Boolean(reader.read_bool()?)),
            2 => Ok(Value::Integer(reader.read_i32()?)),
            3 => Ok(Value::BigInt(reader.read_i64()?)),
            4 => Ok(Value::Float(reader.read_f32()?)),
            5 => Ok(Value::Double(reader.read_f64()?)),
            6 => Ok(Value::Varchar(reader.read_len_str()?)),
            7 => Ok(Value::Text(reader.read_len_str()?)),
            other => Err(DbError::invalid(format!("unknown value tag {}", other))),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Varchar(v) | Value::Text(v) => write!(f, "'{}'", v),
        }
    }
}

/// Check `values` against the schema, filling omitted trailing columns
/// from defaults (or `Null` for nullable columns). Returns the
/// normalized row in schema order.
pub fn validate_values(schema: &TableSchema, values: &[Value]) -> DbResult<Vec<Value>> {
    if values.len() > schema.column_count() {
        return Err(DbError::invalid(format!(
            "{} values for {} columns in table '{}'",
            values.len(),
            schema.column_count(),
            schema.table_name
        )));
    }

    let mut row = Vec::with_capacity(schema.column_count());
    for (i, column) in schema.columns().iter().enumerate() {
        let value = match values.get(i) {
            Some(value) => value.clone(),
            None => match &column.default {
                Some(default) => default.clone(),
                None if column.nullable => Value::Null,
                None => {
                    return Err(DbError::invalid(format!(
                        "no value for column '{}' and no default",
                        column.name
                    )))
                }
            },
        };

        if value.is_null() && !column.nullable {
            return Err(DbError::invalid(format!(
                "null value for non-nullable column '{}'",
                column.name
            )));
        }
        if !value.matches_type(&column.column_type) {
            return Err(DbError::invalid(format!(
                "value {} does not fit column '{}' of type {}",
                value, column.name, column.column_type
            )));
        }
        if let (Value::Varchar(s), ColumnType::Varchar(limit)) = (&value, &column.column_type) {
            if s.len() > *limit as usize {
                return Err(DbError::invalid(format!(
                    "value of {} bytes exceeds {} for column '{}'",
                    s.len(),
                    column.column_type,
                    column.name
                )));
            }
        }
        row.push(value);
    }
    Ok(row)
}

/// Serialize a validated row in schema order: a null-marker byte for
/// nullable columns, raw little-endian fixed-width values, and
/// length-prefixed bytes for var-width values.
pub fn serialize_record(schema: &TableSchema, values: &[Value]) -> DbResult<Vec<u8>> {
    debug_assert_eq!(values.len(), schema.column_count());

    let mut writer = ByteWriter::new();
    for (column, value) in schema.columns().iter().zip(values) {
        if column.nullable {
            writer.write_bool(value.is_null());
            if value.is_null() {
                continue;
            }
        }
        match value {
            Value::Null => {
                return Err(DbError::invalid(format!(
                    "null value for non-nullable column '{}'",
                    column.name
                )))
            }
            Value::Boolean(v) => writer.write_bool(*v),
            Value::Integer(v) => writer.write_i32(*v),
            Value::BigInt(v) => writer.write_i64(*v),
            Value::Float(v) => writer.write_f32(*v),
            Value::Double(v) => writer.write_f64(*v),
            Value::Varchar(v) | Value::Text(v) => writer.write_len_str(v),
        }
    }
    Ok(writer.into_bytes())
}

/// Inverse of [`serialize_record`].
pub fn deserialize_record(schema: &TableSchema, reader: &mut ByteReader<'_>) -> DbResult<Vec<Value>> {
    let mut values = Vec::with_capacity(schema.column_count());
    for column in schema.columns() {
        if column.nullable && reader.read_bool()? {
            values.push(Value::Null);
            continue;
        }
        let value = match column.column_type {
            ColumnType::Boolean => Value::Boolean(reader.read_bool()?),
            ColumnType::Integer => Value::Integer(reader.read_i32()?),
            ColumnType::BigInt => Value::BigInt(reader.read_i64()?),
            ColumnType::Float => Value::Float(reader.read_f32()?),
            ColumnType::Double => Value::Double(reader.read_f64()?),
            ColumnType::Varchar(_) => Value::Varchar(reader.read_len_str()?),
            ColumnType::Text => Value::Text(reader.read_len_str()?),
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::schema::Column;

    fn schema() -> TableSchema {
        TableSchema::new(
            1,
            "t",
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::Varchar(20)).nullable(),
                Column::new("note", ColumnType::Text).nullable(),
                Column::new("flag", ColumnType::Boolean).with_default(Value::Boolean(false)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let schema = schema();
        let row = validate_values(
            &schema,
            &[
                Value::Integer(7),
                Value::Varchar("alice".to_string()),
                Value::Null,
                Value::Boolean(true),
            ],
        )
        .unwrap();

        let bytes = serialize_record(&schema, &row).unwrap();
        let decoded = deserialize_record(&schema, &mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_defaults_fill_missing_columns() {
        let schema = schema();
        let row = validate_values(&schema, &[Value::Integer(1)]).unwrap();
        assert_eq!(
            row,
            vec![
                Value::Integer(1),
                Value::Null,
                Value::Null,
                Value::Boolean(false),
            ]
        );
    }

    #[test]
    fn test_null_in_non_nullable_rejected() {
        let schema = schema();
        assert!(validate_values(&schema, &[Value::Null]).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = schema();
        assert!(validate_values(&schema, &[Value::Text("x".into())]).is_err());
    }

    #[test]
    fn test_varchar_limit_enforced() {
        let schema = schema();
        let long = "x".repeat(21);
        assert!(validate_values(&schema, &[Value::Integer(1), Value::Varchar(long)]).is_err());
    }
}
