//! Structured error types for controller and store operations.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,

    // Not found errors
    TaskNotFound,

    // Conflict errors
    AlreadyExists,
    DependencyCycle,
    UnknownDependency,

    // Infrastructure errors
    DatabaseError,
    InternalError,
}

/// Structured error carried through the store and controller layers.
#[derive(Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingRequiredField,
            format!("{} is required", field),
        )
        .with_field(field)
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn already_exists(task_id: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyExists,
            format!("Task already exists: {}", task_id),
        )
    }

    pub fn dependency_cycle(task_id: &str, depends_on: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!(
                "Making {} depend on {} would create a cycle",
                task_id, depends_on
            ),
        )
    }

    pub fn unknown_dependency(depends_on: &str) -> Self {
        Self::new(
            ErrorCode::UnknownDependency,
            format!("Dependency refers to unknown task: {}", depends_on),
        )
        .with_field("blocked_by")
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

// The database layer works in anyhow; recover our own errors when they were wrapped.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(sql) => Error::database(sql),
                Err(err) => Error::internal(err),
            },
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::database(err)
    }
}

/// Result type for store and controller operations.
pub type Result<T> = std::result::Result<T, Error>;
