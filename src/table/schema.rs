use std::collections::HashMap;

use crate::error::{DbError, DbResult};
use crate::io::{ByteReader, ByteWriter};
use crate::table::value::Value;
use crate::types::TableId;

/// Column type tags. Fixed-width types serialize as raw little-endian
/// values, `Varchar`/`Text` as length-prefixed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Integer,
    BigInt,
    Float,
    Double,
    Varchar(u32),
    Text,
}

impl ColumnType {
    /// Serialized width for fixed-width types, `None` otherwise.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::Integer => Some(4),
            ColumnType::BigInt => Some(8),
            ColumnType::Float => Some(4),
            ColumnType::Double => Some(8),
            ColumnType::Varchar(_) | ColumnType::Text => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::Integer => 1,
            ColumnType::BigInt => 2,
            ColumnType::Float => 3,
            ColumnType::Double => 4,
            ColumnType::Varchar(_) => 5,
            ColumnType::Text => 6,
        }
    }

    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(self.tag());
        if let ColumnType::Varchar(limit) = self {
            writer.write_u32(*limit);
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> DbResult<Self> {
        match reader.read_u8()? {
            0 => Ok(ColumnType::Boolean),
            1 => Ok(ColumnType::Integer),
            2 => Ok(ColumnType::BigInt),
            3 => Ok(ColumnType::Float),
            4 => Ok(ColumnType::Double),
            5 => Ok(ColumnType::Varchar(reader.read_u32()?)),
            6 => Ok(ColumnType::Text),
            other => Err(DbError::invalid(format!("unknown column type tag {}", other))),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Integer => write!(f, "INTEGER"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Varchar(limit) => write!(f, "VARCHAR({})", limit),
            ColumnType::Text => write!(f, "TEXT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_len_str(&self.name);
        self.column_type.encode(writer);
        writer.write_bool(self.nullable);
        match &self.default {
            Some(value) => {
                writer.write_bool(true);
                value.encode(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> DbResult<Self> {
        let name = reader.read_len_str()?;
        let column_type = ColumnType::decode(reader)?;
        let nullable = reader.read_bool()?;
        let default = if reader.read_bool()? {
            Some(Value::decode(reader)?)
        } else {
            None
        };
        Ok(Self {
            name,
            column_type,
            nullable,
            default,
        })
    }
}

/// Per-table metadata: ordered columns, name lookup, fixed-width flag.
/// Built at `CreateTable`, persisted in the table's metadata page.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table_id: TableId,
    pub table_name: String,
    columns: Vec<Column>,
    column_index: HashMap<String, usize>,
    is_fixed_length: bool,
}

impl TableSchema {
    pub fn new(
        table_id: TableId,
        table_name: impl Into<String>,
        columns: Vec<Column>,
    ) -> DbResult<Self> {
        let table_name = table_name.into();
        if columns.is_empty() {
            return Err(DbError::invalid(format!(
                "table '{}' must have at least one column",
                table_name
            )));
        }

        let mut column_index = HashMap::new();
        for (i, column) in columns.iter().enumerate() {
            if column_index.insert(column.name.clone(), i).is_some() {
                return Err(DbError::invalid(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, table_name
                )));
            }
        }

        let is_fixed_length = columns
            .iter()
            .all(|c| c.column_type.fixed_size().is_some());

        Ok(Self {
            table_id,
            table_name,
            columns,
            column_index,
            is_fixed_length,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_position(&self, name: &str) -> DbResult<usize> {
        self.column_index
            .get(name)
            .copied()
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    pub fn is_fixed_length(&self) -> bool {
        self.is_fixed_length
    }

    /// Serialized record size for fixed-width schemas, used only as a
    /// fast-path hint.
    pub fn record_size_hint(&self) -> Option<usize> {
        if !self.is_fixed_length {
            return None;
        }
        let mut size = 0;
        for column in &self.columns {
            if column.nullable {
                size += 1;
            }
            size += column.column_type.fixed_size()?;
        }
        Some(size)
    }

    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.write_i64(self.table_id);
        writer.write_len_str(&self.table_name);
        writer.write_u32(self.columns.len() as u32);
        for column in &self.columns {
            column.encode(writer);
        }
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> DbResult<Self> {
        let table_id = reader.read_i64()?;
        let table_name = reader.read_len_str()?;
        let column_count = reader.read_u32()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(Column::decode(reader)?);
        }
        Self::new(table_id, table_name, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> TableSchema {
        TableSchema::new(
            3,
            "users",
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("name", ColumnType::Varchar(50)).nullable(),
                Column::new("score", ColumnType::Double)
                    .with_default(Value::Double(0.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_column_lookup() {
        let schema = sample_schema();
        assert_eq!(schema.column_position("id").unwrap(), 0);
        assert_eq!(schema.column_position("score").unwrap(), 2);
        assert!(matches!(
            schema.column_position("missing"),
            Err(DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_fixed_length_detection() {
        let schema = sample_schema();
        assert!(!schema.is_fixed_length());
        assert_eq!(schema.record_size_hint(), None);

        let fixed = TableSchema::new(
            1,
            "points",
            vec![
                Column::new("x", ColumnType::Integer),
                Column::new("y", ColumnType::Integer).nullable(),
            ],
        )
        .unwrap();
        assert!(fixed.is_fixed_length());
        // 4 + (1 null marker + 4)
        assert_eq!(fixed.record_size_hint(), Some(9));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = TableSchema::new(
            1,
            "bad",
            vec![
                Column::new("a", ColumnType::Integer),
                Column::new("a", ColumnType::Text),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_round_trip() {
        let schema = sample_schema();
        let mut writer = ByteWriter::new();
        schema.encode(&mut writer);
        let bytes = writer.into_bytes();

        let decoded = TableSchema::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded.table_id, schema.table_id);
        assert_eq!(decoded.table_name, schema.table_name);
        assert_eq!(decoded.columns(), schema.columns());
        assert_eq!(decoded.is_fixed_length(), schema.is_fixed_length());
    }
}
