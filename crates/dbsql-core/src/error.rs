//! Error types for dbsql

use thiserror::Error;

/// Failure to convert a value into the representation a driver or a scan
/// destination expects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("value {value} overflows {target}")]
    Overflow { value: String, target: &'static str },

    #[error("value {value:?} can't be converted to {target}")]
    Unconvertible { value: String, target: &'static str },

    #[error("NULL value not allowed")]
    NullNotAllowed,

    #[error("unsupported conversion from {from} to {to}")]
    Unsupported { from: &'static str, to: &'static str },

    #[error("destination is None")]
    MissingDestination,

    #[error("value {value} out of range for {target}")]
    OutOfRange { value: String, target: &'static str },
}

/// Core error type for dbsql operations
#[derive(Error, Debug, Clone)]
pub enum SqlError {
    /// The physical connection is unusable and must be discarded.
    #[error("driver: bad connection")]
    BadConnection,

    #[error("unknown driver {0:?} (forgotten register?)")]
    UnknownDriver(String),

    #[error("database is closed")]
    DatabaseClosed,

    #[error("{0}")]
    Driver(String),

    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },

    #[error("converting argument #{index}'s type: {source}")]
    ArgumentConversion {
        index: usize,
        #[source]
        source: ConvertError,
    },

    #[error("expected {expected} destination arguments in scan, not {got}")]
    ScanArity { expected: usize, got: usize },

    #[error("scan error on column index {column}: {source}")]
    Scan {
        column: usize,
        #[source]
        source: ConvertError,
    },

    #[error("no rows in result set")]
    NoRows,

    #[error("Rows are closed")]
    RowsClosed,

    #[error("scan called without calling next")]
    ScanWithoutNext,

    #[error("RawBytes isn't allowed on Row::scan")]
    RawBytesInRow,

    #[error("statement is closed")]
    StmtClosed,

    #[error("Transaction has already been committed or rolled back")]
    TxDone,

    #[error("Tx::stmt: statement from different database used")]
    StmtFromOtherDatabase,

    #[error("duplicate driver connection close")]
    DuplicateConnClose,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SqlError {
    /// Whether this error means the connection must be thrown away and the
    /// operation retried elsewhere.
    pub fn is_bad_conn(&self) -> bool {
        matches!(self, SqlError::BadConnection)
    }

    /// Convenience constructor for driver-reported failures.
    pub fn driver(msg: impl Into<String>) -> Self {
        SqlError::Driver(msg.into())
    }
}

/// Result type alias for dbsql operations
pub type Result<T> = std::result::Result<T, SqlError>;
