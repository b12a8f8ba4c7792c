//! Error types for the weight tracker
//!
//! The metrics engine itself is infallible. Errors belong to its collaborators:
//! the record store, input validation and the session glue that ties them together.

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{GoalId, SampleId, UserId};

/// Errors raised by record store back ends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Weight sample not found: {0}")]
    SampleNotFound(SampleId),

    #[error("Goal weight not found: {0}")]
    GoalNotFound(GoalId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("A weight is already recorded on {0}")]
    DuplicateDate(NaiveDate),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

/// Errors from validating user-entered text before it reaches the store
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("Weight cannot be empty")]
    EmptyWeight,

    #[error("Weight must be a positive number: {0}")]
    InvalidWeight(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),
}

/// Errors surfaced by a tracker session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("No user is logged in")]
    NotLoggedIn,

    #[error("Username cannot be empty")]
    EmptyUsername,
}

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}
