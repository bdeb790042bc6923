//! Shared in-memory databases

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dbsql_core::{ColumnConverter, Result, SqlError, Value};
use parking_lot::Mutex;

/// Column types understood by `CREATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    NullBool,
    Int32,
    Int64,
    NullInt64,
    Float64,
    NullFloat64,
    String,
    NullString,
    Blob,
    DateTime,
}

impl ColumnType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => ColumnType::Bool,
            "nullbool" => ColumnType::NullBool,
            "int32" => ColumnType::Int32,
            "int64" => ColumnType::Int64,
            "nullint64" => ColumnType::NullInt64,
            "float64" => ColumnType::Float64,
            "nullfloat64" => ColumnType::NullFloat64,
            "string" => ColumnType::String,
            "nullstring" => ColumnType::NullString,
            "blob" => ColumnType::Blob,
            "datetime" => ColumnType::DateTime,
            _ => return None,
        })
    }

    /// Converter applied to arguments bound to a column of this type
    pub fn converter(self) -> ColumnConverter {
        match self {
            ColumnType::Bool => ColumnConverter::Bool,
            ColumnType::NullBool => ColumnConverter::nullable(ColumnConverter::Bool),
            ColumnType::Int32 => ColumnConverter::Int32,
            ColumnType::String => ColumnConverter::not_null(ColumnConverter::String),
            ColumnType::NullString => ColumnConverter::nullable(ColumnConverter::String),
            ColumnType::Int64 | ColumnType::Float64 => {
                ColumnConverter::not_null(ColumnConverter::Default)
            }
            ColumnType::NullInt64 | ColumnType::NullFloat64 => {
                ColumnConverter::nullable(ColumnConverter::Default)
            }
            ColumnType::DateTime | ColumnType::Blob => ColumnConverter::Default,
        }
    }

    /// Parse a literal written directly into an `INSERT`
    pub fn literal(self, text: &str) -> Result<Value> {
        match self {
            ColumnType::String => Ok(Value::String(text.to_string())),
            ColumnType::Blob => Ok(Value::Bytes(text.as_bytes().to_vec())),
            ColumnType::Int32 => text
                .parse::<i32>()
                .map(|n| Value::Int64(n.into()))
                .map_err(|_| fake_err(format!("invalid conversion to int32 from {text:?}"))),
            other => Err(fake_err(format!(
                "unsupported conversion for pre-bound parameter {text:?} to type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) columns: Vec<(String, ColumnType)>,
    pub(crate) rows: Vec<Vec<Value>>,
}

impl Table {
    pub(crate) fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(column, _)| column == name)
    }

    pub(crate) fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, ty)| *ty)
    }
}

/// One named database; every connection opened on the same name sees the
/// same tables.
pub(crate) struct FakeDb {
    name: String,
    tables: Mutex<HashMap<String, Table>>,
    /// Alternates on each `begin` of a connection opened with `badConn`
    bad_begin: AtomicBool,
}

impl FakeDb {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: Mutex::new(HashMap::new()),
            bad_begin: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn wipe(&self) {
        self.tables.lock().clear();
        tracing::debug!(db = %self.name, "wiped fake database");
    }

    pub(crate) fn create_table(&self, name: &str, columns: Vec<(String, ColumnType)>) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.contains_key(name) {
            return Err(fake_err(format!("table {name:?} already exists")));
        }
        tables.insert(
            name.to_string(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    /// Run `f` against a table, failing if it doesn't exist
    pub(crate) fn with_table<T>(&self, name: &str, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| fake_err(format!("table {name:?} doesn't exist")))?;
        f(table)
    }

    /// Flip the simulated bad-connection state; true means this call fails
    pub(crate) fn next_begin_is_bad(&self) -> bool {
        !self.bad_begin.fetch_xor(true, Ordering::SeqCst)
    }
}

pub(crate) fn fake_err(msg: impl std::fmt::Display) -> SqlError {
    SqlError::driver(format!("fakedb: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_literals() {
        assert_eq!(ColumnType::Int32.literal("7").unwrap(), Value::Int64(7));
        assert_eq!(
            ColumnType::Blob.literal("APHOTO").unwrap(),
            Value::Bytes(b"APHOTO".to_vec())
        );
        assert_eq!(
            ColumnType::Int32.literal("bogusconversion").unwrap_err().to_string(),
            "fakedb: invalid conversion to int32 from \"bogusconversion\""
        );
    }

    #[test]
    fn test_bad_begin_alternates() {
        let db = FakeDb::new("foo");
        assert!(db.next_begin_is_bad());
        assert!(!db.next_begin_is_bad());
        assert!(db.next_begin_is_bad());
    }
}
