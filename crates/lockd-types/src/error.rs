use thiserror::Error;

/// Malformed command or lock input. Rejected at the boundary, never persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown command type '{0}'")]
    UnknownCommandType(String),
    #[error("signature is not valid base64: {0}")]
    SignatureEncoding(String),
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("invalid lock: {0}")]
    InvalidLock(String),
}

impl ValidationError {
    pub fn param(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
