use crate::services::rate_limit::QuotaKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid password ({remaining_attempts} attempts remaining)")]
    InvalidPassword { remaining_attempts: u32 },
    #[error("authentication locked for another {}s", .remaining.as_secs())]
    Locked { remaining: Duration },
    #[error("session expired or not authorized")]
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Memory,
    Initiation,
    Password,
    User,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Memory => "memory",
            EntityKind::Initiation => "initiation",
            EntityKind::Password => "password",
            EntityKind::User => "user",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Busy/locked database, lost connection. Safe to retry.
    #[error("transient storage error: {0}")]
    Transient(#[source] rusqlite::Error),
    #[error("storage error: {0}")]
    Permanent(#[source] rusqlite::Error),
    #[error("storage worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("daily {kind} limit of {limit} reached")]
    RateLimitExceeded { kind: QuotaKind, limit: u32 },
    #[error("memory quota of {max_records} records reached")]
    QuotaExceeded { max_records: u32 },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(PersistenceError::Transient(_))
        )
    }

    /// Lockouts and quota denials are normal outcomes, not faults.
    pub fn is_expected_denial(&self) -> bool {
        matches!(
            self,
            EngineError::Auth(_)
                | EngineError::RateLimitExceeded { .. }
                | EngineError::QuotaExceeded { .. }
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(PersistenceError::from(err))
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        let transient = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        );
        if transient {
            PersistenceError::Transient(err)
        } else {
            PersistenceError::Permanent(err)
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
