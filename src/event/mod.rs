use thiserror::Error;

use crate::attendance::token::TokenError;
use crate::db::StoreError;

pub mod lifecycle;
pub mod service;

pub use lifecycle::{CompletionDetails, EventPatch, NewEvent};
pub use service::EventService;

pub type EventResult<T> = core::result::Result<T, EventError>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event not found")]
    NotFound,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EventError {
    pub fn kind(&self) -> &'static str {
        match self {
            EventError::NotFound => "event_not_found",
            EventError::Forbidden(_) => "forbidden",
            EventError::Conflict(_) => "conflict",
            EventError::Validation(_) => "validation",
            EventError::Token(_) => "token_issue_failed",
            EventError::Store(e) if e.is_transient() => "storage_unavailable",
            EventError::Store(_) => "storage_error",
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, EventError::Store(e) if e.is_transient())
    }
}
