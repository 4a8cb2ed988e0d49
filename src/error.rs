use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wire/framing failures. Fatal to the connection that produced them.
    #[error("wire protocol error: {0}")]
    Wire(String),

    /// Truncated input while decoding a message or document.
    #[error("short input: {0}")]
    DecodeShortInput(String),

    /// Structurally invalid input (bad lengths, bad type bytes, stray NULs).
    #[error("invalid input: {0}")]
    DecodeInvalidInput(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;

/// MongoDB error codes used on the wire.
pub mod codes {
    pub const INTERNAL_ERROR: i32 = 1;
    pub const BAD_VALUE: i32 = 2;
    pub const UNAUTHORIZED: i32 = 13;
    pub const TYPE_MISMATCH: i32 = 14;
    pub const PROTOCOL_ERROR: i32 = 17;
    pub const AUTHENTICATION_FAILED: i32 = 18;
    pub const ILLEGAL_OPERATION: i32 = 20;
    pub const INVALID_BSON: i32 = 22;
    pub const CURSOR_NOT_FOUND: i32 = 43;
    pub const MAX_TIME_MS_EXPIRED: i32 = 50;
    pub const COMMAND_NOT_FOUND: i32 = 59;
    pub const MECHANISM_UNAVAILABLE: i32 = 334;
    pub const DOCUMENT_VALIDATION_FAILURE: i32 = 121;
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const LOCATION_40415: i32 = 40415;
    /// Cursor exists but belongs to another connection.
    pub const CURSOR_NOT_OWNED: i32 = 50738;
}

/// A command failure carrying the wire error code. Converted into an
/// `{ok: 0, errmsg, code, codeName}` reply by the dispatcher.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub code: i32,
    pub code_name: &'static str,
    pub message: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code_name, self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

impl CommandError {
    pub fn new(code: i32, code_name: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, "InternalError", message)
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(codes::BAD_VALUE, "BadValue", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, "Unauthorized", message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(codes::TYPE_MISMATCH, "TypeMismatch", message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(
            codes::AUTHENTICATION_FAILED,
            "AuthenticationFailed",
            message,
        )
    }

    pub fn illegal_operation(message: impl Into<String>) -> Self {
        Self::new(codes::ILLEGAL_OPERATION, "IllegalOperation", message)
    }

    pub fn invalid_bson(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_BSON, "InvalidBSON", message)
    }

    pub fn cursor_not_found(message: impl Into<String>) -> Self {
        Self::new(codes::CURSOR_NOT_FOUND, "CursorNotFound", message)
    }

    pub fn cursor_not_owned(message: impl Into<String>) -> Self {
        Self::new(codes::CURSOR_NOT_OWNED, "Location50738", message)
    }

    pub fn max_time_expired() -> Self {
        Self::new(
            codes::MAX_TIME_MS_EXPIRED,
            "MaxTimeMSExpired",
            "operation exceeded time limit",
        )
    }

    pub fn command_not_found(name: &str) -> Self {
        Self::new(
            codes::COMMAND_NOT_FOUND,
            "CommandNotFound",
            format!("no such command: '{name}'"),
        )
    }

    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(codes::DUPLICATE_KEY, "DuplicateKey", message)
    }

    /// Shape this error as a reply body.
    pub fn to_document(&self) -> bson::Document {
        bson::doc! {
            "ok": 0.0,
            "errmsg": self.message.clone(),
            "code": self.code,
            "codeName": self.code_name,
        }
    }
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        match e {
            Error::DecodeShortInput(m) | Error::DecodeInvalidInput(m) => {
                CommandError::invalid_bson(m)
            }
            other => CommandError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_reply_shape() {
        let err = CommandError::authentication_failed("authentication required");
        let doc = err.to_document();
        assert_eq!(doc.get_f64("ok").unwrap(), 0.0);
        assert_eq!(doc.get_i32("code").unwrap(), 18);
        assert_eq!(doc.get_str("codeName").unwrap(), "AuthenticationFailed");
        assert!(doc.get_str("errmsg").unwrap().contains("auth"));
    }

    #[test]
    fn decode_errors_map_to_invalid_bson() {
        let err: CommandError = Error::DecodeShortInput("truncated document".into()).into();
        assert_eq!(err.code, codes::INVALID_BSON);
    }
}
