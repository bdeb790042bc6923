//! Argument conversion
//!
//! Arguments go through two steps before reaching a driver: the default
//! conversion of the Rust value into a [`Value`] (`ToSqlValue`), then the
//! optional per-placeholder [`ColumnConverter`] the prepared statement asks
//! for.

use chrono::{DateTime, Utc};

use crate::{ConvertError, Value};

/// A Rust value that can be passed as a statement argument.
pub trait ToSqlValue: Send + Sync {
    /// Convert into a driver value
    fn to_sql_value(&self) -> Result<Value, ConvertError>;
}

impl<T: ToSqlValue + ?Sized> ToSqlValue for &T {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        (**self).to_sql_value()
    }
}

impl<T: ToSqlValue> ToSqlValue for Option<T> {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        match self {
            Some(v) => v.to_sql_value(),
            None => Ok(Value::Null),
        }
    }
}

impl ToSqlValue for Value {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(self.clone())
    }
}

impl ToSqlValue for bool {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::Bool(*self))
    }
}

macro_rules! signed_to_sql {
    ($($t:ty),*) => {
        $(
            impl ToSqlValue for $t {
                fn to_sql_value(&self) -> Result<Value, ConvertError> {
                    Ok(Value::Int64(*self as i64))
                }
            }
        )*
    };
}

signed_to_sql!(i8, i16, i32, i64, isize);

macro_rules! unsigned_to_sql {
    ($($t:ty),*) => {
        $(
            impl ToSqlValue for $t {
                fn to_sql_value(&self) -> Result<Value, ConvertError> {
                    i64::try_from(*self)
                        .map(Value::Int64)
                        .map_err(|_| ConvertError::OutOfRange {
                            value: self.to_string(),
                            target: "i64",
                        })
                }
            }
        )*
    };
}

unsigned_to_sql!(u8, u16, u32, u64, usize);

impl ToSqlValue for f32 {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::Float64(*self as f64))
    }
}

impl ToSqlValue for f64 {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::Float64(*self))
    }
}

impl ToSqlValue for str {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::String(self.to_string()))
    }
}

impl ToSqlValue for String {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::String(self.clone()))
    }
}

impl ToSqlValue for [u8] {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::Bytes(self.to_vec()))
    }
}

impl ToSqlValue for Vec<u8> {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::Bytes(self.clone()))
    }
}

impl ToSqlValue for DateTime<Utc> {
    fn to_sql_value(&self) -> Result<Value, ConvertError> {
        Ok(Value::DateTime(*self))
    }
}

/// Per-placeholder conversion a driver can request from its statements.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConverter {
    /// Keep the default conversion
    Default,
    /// Integer that must fit in 32 bits; numeric strings are parsed
    Int32,
    /// Textual value; non-text values are formatted
    String,
    /// Boolean; accepts the usual textual and 0/1 spellings
    Bool,
    /// NULL passes through, anything else goes to the inner converter
    Null(Box<ColumnConverter>),
    /// NULL is rejected, anything else goes to the inner converter
    NotNull(Box<ColumnConverter>),
}

impl ColumnConverter {
    /// `Null` around `inner`
    pub fn nullable(inner: ColumnConverter) -> Self {
        ColumnConverter::Null(Box::new(inner))
    }

    /// `NotNull` around `inner`
    pub fn not_null(inner: ColumnConverter) -> Self {
        ColumnConverter::NotNull(Box::new(inner))
    }

    /// Apply the converter to a value produced by the default conversion.
    pub fn convert(&self, value: Value) -> Result<Value, ConvertError> {
        match self {
            ColumnConverter::Default => Ok(value),
            ColumnConverter::Int32 => convert_int32(value),
            ColumnConverter::String => match value {
                Value::String(_) | Value::Bytes(_) => Ok(value),
                Value::Null => Err(ConvertError::Unsupported {
                    from: "NULL",
                    to: "string",
                }),
                other => Ok(Value::String(other.to_string())),
            },
            ColumnConverter::Bool => convert_bool(value),
            ColumnConverter::Null(inner) => match value {
                Value::Null => Ok(Value::Null),
                other => inner.convert(other),
            },
            ColumnConverter::NotNull(inner) => match value {
                Value::Null => Err(ConvertError::NullNotAllowed),
                other => inner.convert(other),
            },
        }
    }
}

fn check_int32(n: i64) -> Result<Value, ConvertError> {
    if n > i32::MAX as i64 || n < i32::MIN as i64 {
        return Err(ConvertError::Overflow {
            value: n.to_string(),
            target: "int32",
        });
    }
    Ok(Value::Int64(n))
}

fn convert_int32(value: Value) -> Result<Value, ConvertError> {
    match value {
        Value::Int64(n) => check_int32(n),
        Value::String(s) => {
            let n = s.parse::<i64>().map_err(|_| ConvertError::Unconvertible {
                value: s.clone(),
                target: "int32",
            })?;
            check_int32(n)
        }
        Value::Bytes(b) => {
            let s = String::from_utf8_lossy(&b).into_owned();
            convert_int32(Value::String(s))
        }
        other => Err(ConvertError::Unsupported {
            from: other.type_name(),
            to: "int32",
        }),
    }
}

/// Textual spellings accepted as booleans
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn convert_bool(value: Value) -> Result<Value, ConvertError> {
    match value {
        Value::Bool(_) => Ok(value),
        Value::String(s) => parse_bool(&s)
            .map(Value::Bool)
            .ok_or(ConvertError::Unconvertible {
                value: s,
                target: "bool",
            }),
        Value::Bytes(b) => {
            let s = String::from_utf8_lossy(&b).into_owned();
            convert_bool(Value::String(s))
        }
        Value::Int64(1) => Ok(Value::Bool(true)),
        Value::Int64(0) => Ok(Value::Bool(false)),
        Value::Int64(n) => Err(ConvertError::Unconvertible {
            value: n.to_string(),
            target: "bool",
        }),
        other => Err(ConvertError::Unsupported {
            from: other.type_name(),
            to: "bool",
        }),
    }
}
