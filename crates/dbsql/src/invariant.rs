use dbsql_core::SqlError;

/// Report a broken ownership invariant.
///
/// Debug builds panic. Release builds log and hand back an internal error
/// for the caller to surface.
#[track_caller]
pub(crate) fn invariant_violation(msg: impl Into<String>) -> SqlError {
    let msg = msg.into();
    tracing::error!(violation = %msg, "internal invariant violated");
    if cfg!(debug_assertions) {
        panic!("{msg}");
    }
    SqlError::Internal(msg)
}
