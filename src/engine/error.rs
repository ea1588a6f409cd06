use ulid::Ulid;

use super::validator::Rejection;

#[derive(Debug)]
pub enum EngineError {
    /// Validator outcome; never a store fault.
    Rejected(Rejection),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UsernameTaken(String),
    Forbidden(&'static str),
    InvalidField(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            EngineError::Rejected(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rejected(r) => write!(f, "{r}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UsernameTaken(name) => write!(f, "username already taken: {name}"),
            EngineError::Forbidden(what) => write!(f, "permission denied: {what}"),
            EngineError::InvalidField(msg) => write!(f, "invalid value: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
