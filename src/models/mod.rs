pub mod command;
pub mod device;
pub mod event;
pub mod metric;
pub mod telemetry;

/// Returned when a stored string doesn't match any known enum value.
/// Stored rows only ever contain the stable strings from the wire contract,
/// so hitting this means a malformed row (a permanent error, not retryable).
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} value: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
