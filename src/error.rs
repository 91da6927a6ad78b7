use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    BadParams {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("login required")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("system is under maintenance, please try again later")]
    Maintenance,
    #[error("{0}")]
    EntryClosed(String),
    #[error("subject not found for allocation: {0}")]
    UnresolvedSubject(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Io(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        AppError::BadParams {
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        AppError::BadParams {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadParams { .. } => "bad_params",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::Maintenance => "maintenance",
            AppError::EntryClosed(_) => "entry_closed",
            AppError::UnresolvedSubject(_) => "unresolved_subject",
            AppError::NoWorkspace => "no_workspace",
            AppError::Unsupported(_) => "unsupported",
            AppError::Io(_) => "io_failed",
            AppError::Db(e) if is_unique_violation(e) || is_reference_violation(e) => "conflict",
            AppError::Db(_) | AppError::Internal(_) => "server_error",
        }
    }

    /// Message safe to hand back to the caller. Persistence and internal
    /// failures are logged in full and answered generically.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Db(e) if is_unique_violation(e) => "record already exists".to_string(),
            AppError::Db(e) if is_reference_violation(e) => "record is still referenced".to_string(),
            AppError::Db(e) => {
                tracing::error!(error = %e, "persistence failure");
                "internal server error".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!(error = ?e, "internal failure");
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::BadParams { details, .. } => details.clone(),
            AppError::UnresolvedSubject(name) => Some(json!({ "subjectName": name })),
            _ => None,
        }
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn is_reference_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
