use std::io;

use thiserror::Error;

use crate::protocol::Message;
use crate::variable::VarId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("variable {0} not found")]
    UnknownVariable(VarId),

    #[error("variable {id}: parent {parent} not found")]
    UnknownParent { id: VarId, parent: VarId },

    #[error("variable {0} already exists")]
    DuplicateId(VarId),

    #[error("variable {id}: cannot instantiate type '{type_name}'")]
    InvalidType { id: VarId, type_name: String },

    #[error("variable {id}: {reason}")]
    PathFailure { id: VarId, reason: String },

    #[error("variable {id}: {reason}")]
    BadRequest { id: VarId, reason: String },

    #[error("session executor closed")]
    ExecutorClosed,
}

impl SyncError {
    /// The variable the error is about, `0` when there is none.
    pub fn var_id(&self) -> VarId {
        match self {
            SyncError::UnknownVariable(id) | SyncError::DuplicateId(id) => *id,
            SyncError::UnknownParent { id, .. }
            | SyncError::InvalidType { id, .. }
            | SyncError::PathFailure { id, .. }
            | SyncError::BadRequest { id, .. } => *id,
            SyncError::ExecutorClosed => 0,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::UnknownVariable(_) => "not-found",
            SyncError::UnknownParent { .. } => "unknown-parent",
            SyncError::DuplicateId(_) => "duplicate-id",
            SyncError::InvalidType { .. } => "invalid-type",
            SyncError::PathFailure { .. } => "path-failure",
            SyncError::BadRequest { .. } => "bad-request",
            SyncError::ExecutorClosed => "closed",
        }
    }

    pub fn to_message(&self) -> Message {
        Message::Error {
            id: self.var_id(),
            code: Some(self.code().to_string()),
            description: self.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a message, an array of messages or a batch object")]
    UnrecognizedShape,

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("standard variable '{0}' may only start a path")]
    MisplacedStandard(String),

    #[error("invalid index '{0}': indexes are 1-based")]
    ZeroIndex(String),

    #[error("invalid method segment '{0}'")]
    InvalidMethod(String),
}
