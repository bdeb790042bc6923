//! Nullable column wrappers
//!
//! Each type pairs a value with a validity flag. An invalid value is sent as
//! NULL, and scanning NULL leaves the default value with `valid == false`.

use dbsql_core::{ConvertError, ToSqlValue, Value};
use serde::{Deserialize, Serialize};

use crate::scan::ScanDest;

macro_rules! null_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        pub struct $name {
            pub value: $inner,
            pub valid: bool,
        }

        impl $name {
            /// A valid (non-NULL) value
            pub fn new(value: impl Into<$inner>) -> Self {
                Self {
                    value: value.into(),
                    valid: true,
                }
            }

            /// NULL
            pub fn null() -> Self {
                Self::default()
            }

            pub fn as_option(&self) -> Option<&$inner> {
                self.valid.then_some(&self.value)
            }
        }

        impl From<Option<$inner>> for $name {
            fn from(value: Option<$inner>) -> Self {
                match value {
                    Some(value) => Self { value, valid: true },
                    None => Self::null(),
                }
            }
        }

        impl ToSqlValue for $name {
            fn to_sql_value(&self) -> Result<Value, ConvertError> {
                if self.valid {
                    self.value.to_sql_value()
                } else {
                    Ok(Value::Null)
                }
            }
        }

        impl ScanDest for $name {
            fn scan_value(&mut self, src: &Value) -> Result<(), ConvertError> {
                if src.is_null() {
                    *self = Self::null();
                    return Ok(());
                }
                self.value.scan_value(src)?;
                self.valid = true;
                Ok(())
            }
        }
    };
}

null_type!(
    /// A string that may be NULL
    NullString,
    String
);
null_type!(
    /// An int64 that may be NULL
    NullInt64,
    i64
);
null_type!(
    /// A float64 that may be NULL
    NullFloat64,
    f64
);
null_type!(
    /// A bool that may be NULL
    NullBool,
    bool
);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invalid_sends_null() {
        assert_eq!(NullString::null().to_sql_value().unwrap(), Value::Null);
        assert_eq!(
            NullInt64::new(7).to_sql_value().unwrap(),
            Value::Int64(7)
        );
    }

    #[test]
    fn test_scan_null_resets() {
        let mut n = NullFloat64::new(1.5);
        n.scan_value(&Value::Null).unwrap();
        assert_eq!(n, NullFloat64::null());

        let mut b = NullBool::null();
        b.scan_value(&Value::Bool(true)).unwrap();
        assert_eq!(b.as_option(), Some(&true));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(NullString::from(None), NullString::null());
        assert_eq!(
            NullString::from(Some("x".to_string())),
            NullString::new("x")
        );
    }
}
