//! The fake query language
//!
//! Queries are `|`-separated:
//!
//! - `WIPE`
//! - `CREATE|<table>|<col>=<type>,...`
//! - `INSERT|<table>|<col>=<value or ?>,...`
//! - `SELECT|<table>|<col>,...|<col>=?,...`

use std::time::Duration;

use dbsql_core::{ColumnConverter, ExecResult, Result, SqlError, Value};

use crate::database::{ColumnType, FakeDb, fake_err};

/// Table whose `op=?,millis=?` query sleeps when `op` is "sleep"
const MAGIC_TABLE: &str = "magicquery";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InsertValue {
    Literal(Value),
    Placeholder(usize),
}

/// A parsed and validated statement
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Wipe,
    Create {
        table: String,
        columns: Vec<(String, ColumnType)>,
    },
    Insert {
        table: String,
        values: Vec<(String, InsertValue)>,
        converters: Vec<ColumnConverter>,
    },
    Select {
        table: String,
        columns: Vec<String>,
        where_cols: Vec<String>,
    },
}

impl Command {
    pub(crate) fn parse(query: &str, db: &FakeDb) -> Result<Self> {
        let parts: Vec<&str> = query.split('|').collect();
        let (cmd, rest) = parts
            .split_first()
            .ok_or_else(|| fake_err("empty query"))?;
        match *cmd {
            "WIPE" => {
                if !rest.is_empty() {
                    return Err(fake_err("WIPE takes no arguments"));
                }
                Ok(Command::Wipe)
            }
            "CREATE" => parse_create(rest),
            "INSERT" => parse_insert(rest, db),
            "SELECT" => parse_select(rest, db),
            other => Err(fake_err(format!("unsupported command type {other:?}"))),
        }
    }

    pub(crate) fn num_input(&self) -> usize {
        match self {
            Command::Wipe | Command::Create { .. } => 0,
            Command::Insert { converters, .. } => converters.len(),
            Command::Select { where_cols, .. } => where_cols.len(),
        }
    }

    pub(crate) fn converter(&self, index: usize) -> Option<ColumnConverter> {
        match self {
            Command::Insert { converters, .. } => converters.get(index).cloned(),
            _ => None,
        }
    }

    /// Check and convert arguments the way the pool would for a prepared
    /// statement. Used on the direct execution path.
    pub(crate) fn convert_args(&self, args: &[Value]) -> Result<Vec<Value>> {
        let expected = self.num_input();
        if args.len() != expected {
            return Err(SqlError::ArgumentCount {
                expected,
                got: args.len(),
            });
        }
        args.iter()
            .enumerate()
            .map(|(index, arg)| match self.converter(index) {
                Some(converter) => converter
                    .convert(arg.clone())
                    .map_err(|source| SqlError::ArgumentConversion { index, source }),
                None => Ok(arg.clone()),
            })
            .collect()
    }

    pub(crate) fn exec(&self, db: &FakeDb, args: &[Value]) -> Result<ExecResult> {
        match self {
            Command::Wipe => {
                db.wipe();
                Ok(ExecResult::new(0, None))
            }
            Command::Create { table, columns } => {
                db.create_table(table, columns.clone())?;
                Ok(ExecResult::new(0, None))
            }
            Command::Insert { table, values, .. } => db.with_table(table, |t| {
                let mut row = vec![Value::Null; t.columns.len()];
                for (column, value) in values {
                    let index = t
                        .column_index(column)
                        .ok_or_else(|| fake_err(format!("no column {column:?}")))?;
                    row[index] = match value {
                        InsertValue::Literal(v) => v.clone(),
                        InsertValue::Placeholder(n) => args
                            .get(*n)
                            .cloned()
                            .ok_or_else(|| fake_err(format!("missing argument #{n}")))?,
                    };
                }
                t.rows.push(row);
                Ok(ExecResult::new(1, None))
            }),
            Command::Select { .. } => Err(fake_err("SELECT can't be executed without rows")),
        }
    }

    /// Run a `SELECT`, returning column names and materialized rows.
    pub(crate) async fn query(&self, db: &FakeDb, args: &[Value]) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let Command::Select {
            table,
            columns,
            where_cols,
        } = self
        else {
            return Err(fake_err("only SELECT can be queried"));
        };

        if let Some(millis) = magic_sleep(table, where_cols, args) {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        let rows = db.with_table(table, |t| {
            let projection: Vec<usize> = columns
                .iter()
                .map(|c| {
                    t.column_index(c).ok_or_else(|| {
                        fake_err(format!("SELECT on table {table:?} references non-existent column {c:?}"))
                    })
                })
                .collect::<Result<_>>()?;
            let filters: Vec<(usize, String)> = where_cols
                .iter()
                .zip(args)
                .map(|(c, arg)| {
                    t.column_index(c)
                        .map(|i| (i, arg.to_string()))
                        .ok_or_else(|| fake_err(format!("invalid where clause column {c:?}")))
                })
                .collect::<Result<_>>()?;

            Ok(t.rows
                .iter()
                .filter(|row| filters.iter().all(|(i, want)| row[*i].to_string() == *want))
                .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
                .collect())
        })?;
        Ok((columns.clone(), rows))
    }
}

fn magic_sleep(table: &str, where_cols: &[String], args: &[Value]) -> Option<u64> {
    if table != MAGIC_TABLE || where_cols != ["op", "millis"] {
        return None;
    }
    if args.first()?.to_string() != "sleep" {
        return None;
    }
    args.get(1)?.to_string().parse().ok()
}

fn split_pair(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .ok_or_else(|| fake_err(format!("expected name=value, got {spec:?}")))
}

fn parse_create(parts: &[&str]) -> Result<Command> {
    let [table, columns] = parts else {
        return Err(fake_err("invalid CREATE syntax; want CREATE|table|col=type,..."));
    };
    let columns = columns
        .split(',')
        .map(|spec| {
            let (name, ty) = split_pair(spec)?;
            let ty = ColumnType::parse(ty)
                .ok_or_else(|| fake_err(format!("unsupported column type {ty:?}")))?;
            Ok((name.to_string(), ty))
        })
        .collect::<Result<_>>()?;
    Ok(Command::Create {
        table: table.to_string(),
        columns,
    })
}

fn parse_insert(parts: &[&str], db: &FakeDb) -> Result<Command> {
    let [table, assignments] = parts else {
        return Err(fake_err("invalid INSERT syntax; want INSERT|table|col=value,..."));
    };
    db.with_table(table, |t| {
        let mut values = Vec::new();
        let mut converters = Vec::new();
        for spec in assignments.split(',') {
            let (column, value) = split_pair(spec)?;
            let ty = t.column_type(column).ok_or_else(|| {
                fake_err(format!("INSERT table {table:?} references non-existent column {column:?}"))
            })?;
            let value = if value == "?" {
                converters.push(ty.converter());
                InsertValue::Placeholder(converters.len() - 1)
            } else {
                InsertValue::Literal(ty.literal(value)?)
            };
            values.push((column.to_string(), value));
        }
        Ok(Command::Insert {
            table: table.to_string(),
            values,
            converters,
        })
    })
}

fn parse_select(parts: &[&str], db: &FakeDb) -> Result<Command> {
    let (table, columns, wheres) = match parts {
        [table, columns] => (*table, *columns, ""),
        [table, columns, wheres] => (*table, *columns, *wheres),
        _ => return Err(fake_err("invalid SELECT syntax; want SELECT|table|cols|where")),
    };
    let columns: Vec<String> = columns.split(',').map(str::to_string).collect();
    let mut where_cols = Vec::new();
    for spec in wheres.split(',').filter(|s| !s.is_empty()) {
        let (column, value) = split_pair(spec)?;
        if value != "?" {
            return Err(fake_err(format!(
                "SELECT on table {table:?} has pre-bound value for where column {column:?}; need a question mark"
            )));
        }
        where_cols.push(column.to_string());
    }

    db.with_table(table, |t| {
        for c in columns.iter().chain(&where_cols) {
            if t.column_index(c).is_none() {
                return Err(fake_err(format!(
                    "SELECT on table {table:?} references non-existent column {c:?}"
                )));
            }
        }
        Ok(())
    })?;

    Ok(Command::Select {
        table: table.to_string(),
        columns,
        where_cols,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn people() -> FakeDb {
        let db = FakeDb::new("test");
        Command::parse("CREATE|people|name=string,age=int32,photo=blob", &db)
            .unwrap()
            .exec(&db, &[])
            .unwrap();
        db
    }

    #[test]
    fn test_insert_counts_placeholders() {
        let db = people();
        let cmd = Command::parse("INSERT|people|name=Alice,age=?,photo=APHOTO", &db).unwrap();
        assert_eq!(cmd.num_input(), 1);
        assert_eq!(cmd.converter(0), Some(ColumnConverter::Int32));
    }

    #[rstest]
    #[case::unknown_table("SELECT|nope|name|")]
    #[case::unknown_column("SELECT|people|height|")]
    #[case::prebound_where("SELECT|people|name|age=3")]
    #[case::bad_literal("INSERT|people|name=?,age=bogusconversion")]
    #[case::unknown_command("DROP|people")]
    fn test_invalid_statements(#[case] query: &str) {
        let db = people();
        assert!(Command::parse(query, &db).is_err(), "{query} should not parse");
    }

    #[tokio::test]
    async fn test_select_filters_by_textual_value() {
        let db = people();
        for (name, age) in [("Alice", 1), ("Bob", 2)] {
            Command::parse("INSERT|people|name=?,age=?", &db)
                .unwrap()
                .exec(&db, &[Value::from(name), Value::Int64(age)])
                .unwrap();
        }

        let select = Command::parse("SELECT|people|name|age=?", &db).unwrap();
        let (columns, rows) = select.query(&db, &[Value::from("2")]).await.unwrap();
        assert_eq!(columns, vec!["name".to_string()]);
        assert_eq!(rows, vec![vec![Value::from("Bob")]]);
    }

    #[test]
    fn test_direct_args_are_checked() {
        let db = people();
        let cmd = Command::parse("INSERT|people|name=?,age=?", &db).unwrap();
        let err = cmd.convert_args(&[Value::from("x")]).unwrap_err();
        assert_eq!(err.to_string(), "expected 2 arguments, got 1");

        let err = cmd
            .convert_args(&[Value::from("Brad"), Value::Int64(0xFFFF_FFFF)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "converting argument #1's type: value 4294967295 overflows int32"
        );
    }
}
