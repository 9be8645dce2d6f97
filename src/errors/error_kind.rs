use super::internal_error::InternalError;
use std::fmt::{Display, Formatter};

/// Error taxonomy surfaced to shells. Every variant pairs a machine-readable
/// kind (`kind()`) with a human-oriented message (`Display`).
#[derive(Debug)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists(String),
    Busy,
    ConstraintViolation(String),
    IoError(anyhow::Error),
    Corrupt(String),
    AuthFailed,
    PinInvalid,
    PinExpired,
    Locked,
    PeerDisconnected,
    Timeout,
    ProtocolError(String),
    Cancelled,
    ChecksumMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

impl ErrorKind {
    /// Wrap an I/O failure with its file-operation context.
    pub(crate) fn io_context(err: std::io::Error, context: InternalError) -> ErrorKind {
        ErrorKind::IoError(anyhow::Error::new(err).context(context))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists(_) => "ALREADY_EXISTS",
            ErrorKind::Busy => "BUSY",
            ErrorKind::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            ErrorKind::IoError(_) => "IO_ERROR",
            ErrorKind::Corrupt(_) => "CORRUPT",
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::PinInvalid => "PIN_INVALID",
            ErrorKind::PinExpired => "PIN_EXPIRED",
            ErrorKind::Locked => "LOCKED",
            ErrorKind::PeerDisconnected => "PEER_DISCONNECTED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ProtocolError(_) => "PROTOCOL_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
        }
    }

    /// Rebuild a payload-carried wire kind. Variants whose context cannot
    /// cross the wire come back as their bare form.
    pub fn from_kind(kind: &str) -> Option<ErrorKind> {
        Some(match kind {
            "NOT_FOUND" => ErrorKind::NotFound,
            "BUSY" => ErrorKind::Busy,
            "AUTH_FAILED" => ErrorKind::AuthFailed,
            "PIN_INVALID" => ErrorKind::PinInvalid,
            "PIN_EXPIRED" => ErrorKind::PinExpired,
            "LOCKED" => ErrorKind::Locked,
            "PEER_DISCONNECTED" => ErrorKind::PeerDisconnected,
            "TIMEOUT" => ErrorKind::Timeout,
            "CANCELLED" => ErrorKind::Cancelled,
            _ => return None,
        })
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => f.write_str("The requested record could not be found."),
            ErrorKind::AlreadyExists(what) => {
                write!(f, "'{what}' already exists.")
            }
            ErrorKind::Busy => f.write_str("Another operation is in progress. Try again later."),
            ErrorKind::ConstraintViolation(detail) => {
                write!(f, "A store constraint was violated: {detail}")
            }
            ErrorKind::IoError(err) => write!(f, "An I/O error occurred: {err}"),
            ErrorKind::Corrupt(detail) => {
                write!(f, "The local store is corrupt: {detail}")
            }
            ErrorKind::AuthFailed => f.write_str("The peer does not share this family's secret."),
            ErrorKind::PinInvalid => f.write_str("The pairing PIN is not correct."),
            ErrorKind::PinExpired => f.write_str("The pairing PIN has expired."),
            ErrorKind::Locked => {
                f.write_str("Pairing is temporarily locked after repeated failures.")
            }
            ErrorKind::PeerDisconnected => f.write_str("The peer disconnected."),
            ErrorKind::Timeout => f.write_str("The operation timed out."),
            ErrorKind::ProtocolError(detail) => {
                write!(f, "The peer sent an invalid message: {detail}")
            }
            ErrorKind::Cancelled => f.write_str("The operation was cancelled."),
            ErrorKind::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "Checksum verification failed (expected {expected}, got {actual})."
                )
            }
        }
    }
}

impl std::error::Error for ErrorKind {}

impl From<std::io::Error> for ErrorKind {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::IoError(value.into()),
        }
    }
}

impl From<anyhow::Error> for ErrorKind {
    fn from(value: anyhow::Error) -> Self {
        ErrorKind::IoError(value)
    }
}

impl From<sqlx::Error> for ErrorKind {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                if message.contains("UNIQUE constraint failed")
                    || message.contains("FOREIGN KEY constraint failed")
                    || message.contains("CHECK constraint failed")
                {
                    ErrorKind::ConstraintViolation(message)
                } else if message.contains("database is locked")
                    || message.contains("database table is locked")
                {
                    ErrorKind::Busy
                } else if message.contains("malformed") || message.contains("not a database") {
                    ErrorKind::Corrupt(message)
                } else {
                    ErrorKind::IoError(value.into())
                }
            }
            _ => ErrorKind::IoError(value.into()),
        }
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(value: serde_json::Error) -> Self {
        ErrorKind::ProtocolError(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_for_wire_errors() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::Busy,
            ErrorKind::AuthFailed,
            ErrorKind::PinInvalid,
            ErrorKind::PinExpired,
            ErrorKind::Locked,
            ErrorKind::PeerDisconnected,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
        ] {
            let name = kind.kind();
            let back = ErrorKind::from_kind(name).unwrap();
            assert_eq!(back.kind(), name);
        }
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(ErrorKind::from(err), ErrorKind::NotFound));
    }
}
