use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid stage {index} ({stage}): {reason}")]
    InvalidStage {
        index: usize,
        stage: &'static str,
        reason: String,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("invalid classification rules: {0}")]
    InvalidRules(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("type mismatch: {op} expects {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("group stage exceeded {limit} distinct keys")]
    GroupLimitExceeded { limit: usize },

    #[error("stage {index} ({stage}) failed: {source}")]
    Stage {
        index: usize,
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("pipeline exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed pipeline or missing collaborator, caught before any document is processed.
    Validation,
    /// Raised while documents flow through a stage.
    Evaluation,
    /// Caller-imposed deadline exceeded.
    Timeout,
    /// Failure reading or decoding input collections.
    Input,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPipeline(_)
            | Error::InvalidStage { .. }
            | Error::InvalidQuery(_)
            | Error::InvalidExpression(_)
            | Error::InvalidRules(_)
            | Error::CollectionNotFound(_)
            | Error::NotAnObject => ErrorKind::Validation,
            Error::TypeMismatch { .. } | Error::GroupLimitExceeded { .. } => ErrorKind::Evaluation,
            Error::Stage { source, .. } => match source.kind() {
                ErrorKind::Timeout => ErrorKind::Timeout,
                _ => ErrorKind::Evaluation,
            },
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidInput(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Input,
        }
    }

    /// Index of the stage that failed, if the error is tied to one.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Error::InvalidStage { index, .. } | Error::Stage { index, .. } => Some(*index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
