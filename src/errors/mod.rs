mod error_kind;
mod internal_error;

pub use error_kind::{ErrorKind, Result};
pub use internal_error::InternalError;
