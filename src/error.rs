use thiserror::Error;

/// Domain error taxonomy. Every fallible operation in the simulation core
/// resolves to one of these; the HTTP layer maps them to status codes.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation: duplicate vote, duplicate pending merge request,
    /// party name collision, stale tick watermark.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not valid for the entity's current status/stage.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Missing required server-side secret. Fatal; requires operator action.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl SimError {
    pub fn http_status(&self) -> u16 {
        match self {
            SimError::Validation(_) | SimError::InvalidState(_) => 400,
            SimError::Unauthorized(_) => 401,
            SimError::Forbidden(_) => 403,
            SimError::NotFound(_) => 404,
            SimError::Conflict(_) => 409,
            SimError::Misconfiguration(_) | SimError::Storage(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SimError::Validation(_) => "validation",
            SimError::Forbidden(_) => "forbidden",
            SimError::NotFound(_) => "not_found",
            SimError::Conflict(_) => "conflict",
            SimError::InvalidState(_) => "invalid_state",
            SimError::Unauthorized(_) => "unauthorized",
            SimError::Misconfiguration(_) => "misconfiguration",
            SimError::Storage(_) => "storage",
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;

/// Map a rusqlite error to Conflict when it is a UNIQUE constraint violation,
/// otherwise pass it through as a storage error. Two concurrent writers racing
/// on the same key get exactly one success and one Conflict.
pub fn unique_conflict(err: rusqlite::Error, what: &str) -> SimError {
    if let rusqlite::Error::SqliteFailure(ref code, _) = err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return SimError::Conflict(what.to_string());
        }
    }
    SimError::Storage(err)
}
