//! Scanning driver values into Rust destinations

use chrono::{DateTime, Utc};
use dbsql_core::{ConvertError, Value, parse_bool};

/// A place a column value can be copied into.
pub trait ScanDest: Send {
    /// Store `src` into `self`
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError>;

    /// Whether this destination borrows the cursor's buffer semantics
    fn is_raw_bytes(&self) -> bool {
        false
    }
}

/// Bytes scanned without allocating a fresh buffer per row.
///
/// The buffer is overwritten by the next scan, so it is only meaningful
/// while iterating [`Rows`](crate::Rows); single-row queries reject it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBytes(Vec<u8>);

impl RawBytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl ScanDest for RawBytes {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        self.0.clear();
        match src {
            Value::Null => {}
            Value::Bytes(b) => self.0.extend_from_slice(b),
            Value::String(s) => self.0.extend_from_slice(s.as_bytes()),
            other => self.0.extend_from_slice(other.to_string().as_bytes()),
        }
        Ok(())
    }

    fn is_raw_bytes(&self) -> bool {
        true
    }
}

fn unsupported(src: &Value, to: &'static str) -> ConvertError {
    ConvertError::Unsupported {
        from: src.type_name(),
        to,
    }
}

impl ScanDest for Value {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = src.clone();
        Ok(())
    }
}

impl ScanDest for String {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = match src {
            Value::Null => return Err(unsupported(src, "String")),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::DateTime(t) => t.to_rfc3339(),
            other => other.to_string(),
        };
        Ok(())
    }
}

impl ScanDest for Vec<u8> {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = match src {
            Value::Null => Vec::new(),
            Value::Bytes(b) => b.clone(),
            Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        };
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(s: &str, target: &'static str) -> Result<T, ConvertError> {
    s.trim().parse().map_err(|_| ConvertError::Unconvertible {
        value: s.to_string(),
        target,
    })
}

impl ScanDest for i64 {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = match src {
            Value::Int64(n) => *n,
            Value::String(s) => parse_number(s, "i64")?,
            Value::Bytes(b) => parse_number(&String::from_utf8_lossy(b), "i64")?,
            other => return Err(unsupported(other, "i64")),
        };
        Ok(())
    }
}

impl ScanDest for i32 {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        let mut wide = 0i64;
        wide.scan_value(src)?;
        *self = i32::try_from(wide).map_err(|_| ConvertError::OutOfRange {
            value: wide.to_string(),
            target: "i32",
        })?;
        Ok(())
    }
}

impl ScanDest for f64 {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = match src {
            Value::Float64(f) => *f,
            Value::Int64(n) => *n as f64,
            Value::String(s) => parse_number(s, "f64")?,
            Value::Bytes(b) => parse_number(&String::from_utf8_lossy(b), "f64")?,
            other => return Err(unsupported(other, "f64")),
        };
        Ok(())
    }
}

impl ScanDest for bool {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        let text = match src {
            Value::Bool(b) => {
                *self = *b;
                return Ok(());
            }
            Value::Int64(1) => {
                *self = true;
                return Ok(());
            }
            Value::Int64(0) => {
                *self = false;
                return Ok(());
            }
            Value::String(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            other => return Err(unsupported(other, "bool")),
        };
        *self = parse_bool(&text).ok_or(ConvertError::Unconvertible {
            value: text.clone(),
            target: "bool",
        })?;
        Ok(())
    }
}

impl ScanDest for DateTime<Utc> {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        *self = match src {
            Value::DateTime(t) => *t,
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| ConvertError::Unconvertible {
                    value: s.clone(),
                    target: "DateTime<Utc>",
                })?,
            other => return Err(unsupported(other, "DateTime<Utc>")),
        };
        Ok(())
    }
}

macro_rules! nullable_dest {
    ($($t:ty),*) => {
        $(
            impl ScanDest for Option<$t> {
                fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
                    if src.is_null() {
                        *self = None;
                        return Ok(());
                    }
                    let mut value = <$t>::default();
                    value.scan_value(src)?;
                    *self = Some(value);
                    Ok(())
                }
            }
        )*
    };
}

nullable_dest!(String, Vec<u8>, i64, i32, f64, bool, DateTime<Utc>);

/// An optional reference: `None` is a missing destination and fails to scan.
impl<T: ScanDest + ?Sized> ScanDest for Option<&mut T> {
    fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
        match self {
            Some(dest) => dest.scan_value(src),
            None => Err(ConvertError::MissingDestination),
        }
    }

    fn is_raw_bytes(&self) -> bool {
        self.as_ref().is_some_and(|dest| dest.is_raw_bytes())
    }
}
